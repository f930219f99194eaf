//! Integration tests for JobManager over a real storage root.
//!
//! This test suite validates:
//! - Pool construction and configuration errors
//! - Paused queues keep every job; resume drains them
//! - Cancel removes exactly one job, and only once
//! - Retry budget, backoff ordering and uncounted failures
//! - Least-loaded routing across workers
//! - Concurrent producers, restart recovery and event re-publishing
//! - Records written by another process wake workers with polling off
//!
//! ISOLATION: every test owns a fresh temporary storage root, so workers from
//! parallel tests never see each other's jobs.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use spool_jobs::{
    handler_fn, CubicBackoff, Error, JobArguments, JobContext, JobEvent, JobHandler, JobManager,
    JobManagerBuilder, JobOutcome, JobResult, JobStore, ManagerConfig, NoOpHandler,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Short poll interval so tests never wait on the production fallback.
const TEST_POLL: Duration = Duration::from_millis(50);

fn test_config(root: &Path) -> ManagerConfig {
    ManagerConfig::new(root).with_poll_interval(TEST_POLL)
}

async fn start(config: ManagerConfig, handler: impl JobHandler + 'static) -> JobManager {
    JobManager::new(config, Arc::new(handler))
        .await
        .expect("Failed to start job manager")
}

/// Poll `condition` until it holds or `timeout_secs` elapse.
async fn wait_for<F, Fut>(timeout_secs: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_count(manager: &JobManager, expected: usize, timeout_secs: u64) -> bool {
    wait_for(timeout_secs, || async move { manager.job_count().await == expected }).await
}

async fn wait_until_stored(manager: &JobManager, id: &str, timeout_secs: u64) -> bool {
    wait_for(timeout_secs, || async move {
        manager.list_jobs().await.iter().any(|job| job.id() == id)
    })
    .await
}

/// One handler invocation as seen by `FailingHandler`.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    retry_count: u32,
    due_at: DateTime<Utc>,
    ran_at: DateTime<Utc>,
}

/// Handler that records every attempt and always fails.
struct FailingHandler {
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl FailingHandler {
    fn new() -> (Self, Arc<Mutex<Vec<Attempt>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                attempts: attempts.clone(),
            },
            attempts,
        )
    }
}

#[async_trait::async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.attempts.lock().await.push(Attempt {
            retry_count: ctx.retry_count(),
            due_at: ctx.job.next_eligible_at(),
            ran_at: Utc::now(),
        });
        JobResult::Failed("always fails".into())
    }
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

#[tokio::test]
async fn test_zero_workers_is_config_error() {
    let dir = TempDir::new().unwrap();
    let result = JobManager::new(test_config(dir.path()).with_workers(0), Arc::new(NoOpHandler)).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_missing_storage_root_is_config_error() {
    let result = JobManager::new(ManagerConfig::default(), Arc::new(NoOpHandler)).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_creates_one_location_per_worker() {
    let dir = TempDir::new().unwrap();
    let manager = start(test_config(dir.path()).with_workers(3), NoOpHandler).await;

    assert_eq!(manager.worker_count(), 3);
    for index in 0..3 {
        assert!(dir.path().join(format!("worker-{index}")).is_dir());
    }
    assert_eq!(manager.job_count().await, 0);
    manager.shutdown().await;
}

// ============================================================================
// PAUSE / RESUME
// ============================================================================

#[tokio::test]
async fn test_paused_enqueues_are_counted_then_drained() {
    let dir = TempDir::new().unwrap();
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    let manager = start(
        test_config(dir.path()).with_workers(2).with_paused(true),
        handler_fn(move |_ctx: JobContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Success
            }
        }),
    )
    .await;

    for i in 0..5 {
        manager.enqueue(JobArguments::new().with("n", i)).await;
    }
    assert_eq!(manager.job_count().await, 5);

    sleep(TEST_POLL * 4).await;
    assert_eq!(manager.job_count().await, 5, "paused manager must not process");
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    manager.set_paused(false);
    assert!(wait_for_count(&manager, 0, 10).await, "jobs were not drained");
    assert_eq!(executed.load(Ordering::SeqCst), 5);
    manager.shutdown().await;
}

// ============================================================================
// CANCEL
// ============================================================================

#[tokio::test]
async fn test_cancel_removes_once() {
    let dir = TempDir::new().unwrap();
    let manager = start(test_config(dir.path()).with_paused(true), NoOpHandler).await;

    let keep = manager.enqueue(JobArguments::new().with("keep", true)).await;
    let doomed = manager.enqueue(JobArguments::new().with("keep", false)).await;
    assert!(wait_until_stored(&manager, &keep, 5).await);
    assert!(wait_until_stored(&manager, &doomed, 5).await);
    assert_eq!(manager.job_count().await, 2);

    manager.cancel(&doomed).await.expect("first cancel should succeed");
    assert_eq!(manager.job_count().await, 1);

    let err = manager.cancel(&doomed).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(manager.job_count().await, 1);

    let remaining: Vec<_> = manager.list_jobs().await.iter().map(|j| j.id().to_string()).collect();
    assert_eq!(remaining, vec![keep]);
    manager.shutdown().await;
}

// ============================================================================
// RETRIES
// ============================================================================

#[tokio::test]
async fn test_no_retry_budget_means_single_attempt() {
    let dir = TempDir::new().unwrap();
    let (handler, attempts) = FailingHandler::new();
    let manager = start(test_config(dir.path()).with_max_retries(0), handler).await;

    manager.enqueue(JobArguments::new()).await;
    assert!(wait_for_count(&manager, 0, 5).await, "failed job was not deleted");

    sleep(TEST_POLL * 4).await;
    let attempts = attempts.lock().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].retry_count, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_retries_exhaust_budget_with_cubic_delays() {
    let dir = TempDir::new().unwrap();
    let base = Duration::from_millis(100);
    let (handler, attempts) = FailingHandler::new();
    let manager = start(
        test_config(dir.path())
            .with_max_retries(2)
            .with_backoff(CubicBackoff::new(base)),
        handler,
    )
    .await;

    manager.enqueue(JobArguments::new().with("kind", "flaky")).await;

    let (seen, pool) = (&attempts, &manager);
    let done = wait_for(10, || async move {
        seen.lock().await.len() == 3 && pool.job_count().await == 0
    })
    .await;
    assert!(done, "expected three attempts followed by deletion");

    sleep(TEST_POLL * 4).await;
    let attempts = attempts.lock().await;
    assert_eq!(attempts.len(), 3, "no attempt after the budget is spent");

    let retries: Vec<u32> = attempts.iter().map(|a| a.retry_count).collect();
    assert_eq!(retries, vec![0, 1, 2]);

    // Retry r is due base * r^3 after the failed attempt before it. The
    // reschedule happens just after that attempt returns, hence the slack.
    let slack = chrono::Duration::milliseconds(500);
    for (r, pair) in (1u32..).zip(attempts.windows(2)) {
        let (failed, retried) = (pair[0], pair[1]);
        let delay = chrono::Duration::from_std(base * r.pow(3)).unwrap();
        let waited = retried.due_at - failed.ran_at;
        assert!(waited >= delay, "retry {r} due too early: {waited} < {delay}");
        assert!(waited <= delay + slack, "retry {r} due too late: {waited} > {delay}");
        assert!(retried.ran_at >= retried.due_at, "retry {r} ran before it was due");
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_uncounted_failures_never_delete() {
    let dir = TempDir::new().unwrap();
    let (handler, attempts) = FailingHandler::new();
    let manager = start(
        test_config(dir.path())
            .with_max_retries(0)
            .with_failures_counted(false),
        handler,
    )
    .await;

    let id = manager.enqueue(JobArguments::new()).await;

    let seen = &attempts;
    let retried = wait_for(10, || async move { seen.lock().await.len() >= 3 }).await;
    assert!(retried, "uncounted failures should be attempted again");

    let jobs = manager.list_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id(), id);
    assert_eq!(jobs[0].retry_count(), 0);
    assert!(attempts.lock().await.iter().all(|a| a.retry_count == 0));
    manager.shutdown().await;
}

// ============================================================================
// ROUTING
// ============================================================================

#[tokio::test]
async fn test_least_loaded_distribution() {
    let dir = TempDir::new().unwrap();
    let workers = 3;
    let manager = start(
        test_config(dir.path()).with_workers(workers).with_paused(true),
        NoOpHandler,
    )
    .await;

    for _ in 0..=workers {
        manager.enqueue(JobArguments::new()).await;
    }

    let counts = join_all(manager.workers().iter().map(|w| w.job_count())).await;
    assert!(counts.iter().all(|c| *c >= 1), "every worker gets a job: {counts:?}");
    assert_eq!(counts.iter().filter(|c| **c == 2).count(), 1, "{counts:?}");
    assert_eq!(counts.iter().sum::<usize>(), workers + 1);
    manager.shutdown().await;
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_concurrent_enqueues_each_run_once() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("output.txt");
    let out = output.clone();
    let manager = start(
        test_config(&dir.path().join("spool")).with_workers(2),
        handler_fn(move |ctx: JobContext| {
            let out = out.clone();
            async move {
                let line = ctx.arguments().get_str("line").unwrap_or_default().to_string();
                let written = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&out)
                    .and_then(|mut f| writeln!(f, "{line}"));
                match written {
                    Ok(()) => JobResult::Success,
                    Err(e) => JobResult::Failed(e.to_string()),
                }
            }
        }),
    )
    .await;

    let ids = join_all((0..3).map(|i| manager.enqueue(JobArguments::new().with("line", format!("line-{i}"))))).await;
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3, "ids must be unique");

    assert!(wait_for_count(&manager, 0, 10).await);
    let contents = std::fs::read_to_string(&output).unwrap();
    let mut lines: Vec<_> = contents.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["line-0", "line-1", "line-2"]);
    manager.shutdown().await;
}

// ============================================================================
// RESTART
// ============================================================================

#[tokio::test]
async fn test_jobs_survive_restart() {
    let dir = TempDir::new().unwrap();

    let first = start(test_config(dir.path()).with_workers(2).with_paused(true), NoOpHandler).await;
    let a = first.enqueue(JobArguments::new().with("n", 1)).await;
    let b = first.enqueue(JobArguments::new().with("n", 2)).await;
    assert!(wait_until_stored(&first, &a, 5).await);
    assert!(wait_until_stored(&first, &b, 5).await);
    first.shutdown().await;
    drop(first);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let second = start(
        test_config(dir.path()).with_workers(2),
        handler_fn(move |ctx: JobContext| {
            let record = record.clone();
            async move {
                record.lock().await.push(ctx.job_id().to_string());
                JobResult::Success
            }
        }),
    )
    .await;

    assert!(wait_for_count(&second, 0, 10).await, "persisted jobs not processed");
    let mut seen = seen.lock().await.clone();
    seen.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(seen, expected);
    second.shutdown().await;
}

#[tokio::test]
async fn test_job_written_by_another_process_runs_without_polling() {
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let manager = start(
        ManagerConfig::new(dir.path())
            .with_workers(2)
            .with_poll_interval(Duration::from_secs(3600)),
        handler_fn(move |ctx: JobContext| {
            let record = record.clone();
            async move {
                record.lock().await.push(ctx.job_id().to_string());
                JobResult::Success
            }
        }),
    )
    .await;
    sleep(Duration::from_millis(200)).await;

    // What `spoold enqueue` does: write straight into a worker location.
    let store = JobStore::new(dir.path().join("worker-1"));
    store
        .create("external-job", &JobArguments::new().with("command", "true"))
        .await
        .unwrap();

    let seen_ref = &seen;
    let ran = wait_for(5, || async move { !seen_ref.lock().await.is_empty() }).await;
    assert!(ran, "storage change should wake the owning worker");
    assert_eq!(*seen.lock().await, vec!["external-job".to_string()]);
    assert!(wait_for_count(&manager, 0, 5).await);
    manager.shutdown().await;
}

// ============================================================================
// EVENTS
// ============================================================================

#[tokio::test]
async fn test_events_are_republished_as_snapshots() {
    let dir = TempDir::new().unwrap();
    let manager = JobManagerBuilder::new(dir.path())
        .with_config(ManagerConfig::default().with_workers(2).with_poll_interval(TEST_POLL))
        .with_handler(NoOpHandler)
        .build()
        .await
        .unwrap();
    let mut events = manager.events();

    let id = manager.enqueue(JobArguments::new()).await;

    let started = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    match started {
        JobEvent::Started(job) => assert_eq!(job.id(), id),
        other => panic!("expected Started, got {other:?}"),
    }

    let finished = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    match finished {
        JobEvent::Finished { job, outcome } => {
            assert_eq!(job.id(), id);
            assert_eq!(outcome, JobOutcome::Success);
        }
        other => panic!("expected Finished, got {other:?}"),
    }

    assert!(wait_for_count(&manager, 0, 5).await);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_attempt_reports_fail_outcome() {
    let dir = TempDir::new().unwrap();
    let (handler, _attempts) = FailingHandler::new();
    let manager = start(test_config(dir.path()), handler).await;
    let mut events = manager.events();

    manager.enqueue(JobArguments::new()).await;

    let outcome = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(JobEvent::Finished { outcome, .. }) = events.recv().await {
                return outcome;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(outcome, JobOutcome::Fail);
    manager.shutdown().await;
}
