//! spoold: run a spool job pool over shell commands, or feed one.
//!
//! `spoold run` executes the `command` argument of every job with `sh -c`;
//! a zero exit status is success. `spoold enqueue` writes a job straight into
//! the least loaded worker location of a storage root, where a running pool
//! (in this or any other process) picks it up.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::process::Command;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use spool_jobs::defaults::WORKER_DIR_PREFIX;
use spool_jobs::{
    JobArguments, JobContext, JobEvent, JobHandler, JobManager, JobResult, JobStore, ManagerConfig,
};

#[derive(Parser)]
#[command(name = "spoold")]
#[command(author, version, about = "Filesystem-backed background job runner")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker pool until interrupted
    Run {
        /// Storage root (default: $SPOOL_STORAGE_ROOT)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Number of workers (default: $SPOOL_WORKERS or 1)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Retry budget per job (default: $SPOOL_MAX_RETRIES or 0)
        #[arg(short, long)]
        max_retries: Option<u32>,

        /// Fallback poll interval in seconds (default: $SPOOL_POLL_INTERVAL_SECS or 20)
        #[arg(short, long)]
        poll_interval_secs: Option<u64>,
    },

    /// Queue a shell command
    Enqueue {
        /// Storage root
        #[arg(short, long)]
        root: PathBuf,

        /// Extra key=value arguments stored with the job
        #[arg(short, long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// Command line passed to `sh -c`
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// List stored jobs
    List {
        /// Storage root
        #[arg(short, long)]
        root: PathBuf,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

/// Runs the job's `command` argument through the shell.
struct ShellHandler;

#[async_trait]
impl JobHandler for ShellHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let Some(command) = ctx.arguments().get_str("command") else {
            return JobResult::Failed("job has no `command` argument".into());
        };

        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("SPOOL_JOB_ID", ctx.job_id())
            .env("SPOOL_RETRY_COUNT", ctx.retry_count().to_string())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => JobResult::Success,
            Ok(status) => JobResult::Failed(format!("command exited with {status}")),
            Err(e) => JobResult::Failed(format!("failed to spawn shell: {e}")),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` filters.
fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "spoold=info,spool_jobs=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            root,
            workers,
            max_retries,
            poll_interval_secs,
        } => {
            let mut config = ManagerConfig::from_env();
            if let Some(root) = root {
                config = config.with_storage_root(root);
            }
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(max_retries) = max_retries {
                config = config.with_max_retries(max_retries);
            }
            if let Some(secs) = poll_interval_secs {
                config = config.with_poll_interval(Duration::from_secs(secs));
            }
            cmd_run(config).await
        }
        Commands::Enqueue {
            root,
            args,
            command,
        } => cmd_enqueue(&root, args, command.join(" ")).await,
        Commands::List { root } => cmd_list(&root).await,
    }
}

async fn cmd_run(config: ManagerConfig) -> anyhow::Result<()> {
    let manager = JobManager::new(config, Arc::new(ShellHandler)).await?;
    let mut events = manager.events();

    info!(pending = manager.job_count().await, "spoold running, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(JobEvent::Started(job)) => info!(job_id = %job.id(), "started"),
                Ok(JobEvent::Finished { job, outcome }) => info!(job_id = %job.id(), %outcome, "finished"),
                Err(e) => warn!(error = %e, "event stream interrupted"),
            },
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn cmd_enqueue(
    root: &Path,
    args: Vec<(String, String)>,
    command: String,
) -> anyhow::Result<()> {
    let mut arguments: JobArguments = args.into_iter().collect();
    arguments.insert("command", command);

    let store = least_loaded_store(root).await?;
    let id = Uuid::now_v7().to_string();
    store.create(&id, &arguments).await?;

    let output = serde_json::json!({
        "job_id": id,
        "location": store.location().to_string_lossy(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_list(root: &Path) -> anyhow::Result<()> {
    let mut jobs = Vec::new();
    for store in worker_stores(root).await? {
        for record in store.list().await? {
            jobs.push(serde_json::json!({
                "job_id": record.id(),
                "location": store.location().to_string_lossy(),
                "arguments": record.arguments(),
                "retry_count": record.retry_count(),
                "next_eligible_at": record.next_eligible_at().to_rfc3339(),
            }));
        }
    }
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

/// Stores for every `worker-*` directory under `root`, sorted by name.
async fn worker_stores(root: &Path) -> anyhow::Result<Vec<JobStore>> {
    let mut locations = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_worker = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(WORKER_DIR_PREFIX));
        if is_worker && entry.file_type().await?.is_dir() {
            locations.push(entry.path());
        }
    }
    locations.sort();
    Ok(locations.into_iter().map(JobStore::new).collect())
}

async fn least_loaded_store(root: &Path) -> anyhow::Result<JobStore> {
    let mut best: Option<(usize, JobStore)> = None;
    for store in worker_stores(root).await? {
        let count = store.count().await?;
        if best.as_ref().map_or(true, |(min, _)| count < *min) {
            best = Some((count, store));
        }
    }

    let store = match best {
        Some((_, store)) => store,
        None => JobStore::new(root.join(format!("{WORKER_DIR_PREFIX}0"))),
    };
    store.init().await?;
    Ok(store)
}
