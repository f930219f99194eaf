//! Worker pool: routing, aggregation and event re-publishing.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::fs;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use spool_core::defaults::WORKER_DIR_PREFIX;
use spool_core::{Error, JobArguments, JobOutcome, JobSnapshot, Result};

use crate::config::ManagerConfig;
use crate::handler::JobHandler;
use crate::pause::PauseState;
use crate::store::JobRecord;
use crate::worker::{list_sorted, Worker, WorkerEvent};

/// Job lifecycle event re-published by the manager.
///
/// Carries a [`JobSnapshot`], never a handle to the stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started(JobSnapshot),
    Finished {
        job: JobSnapshot,
        outcome: JobOutcome,
    },
}

/// Owns a fixed pool of workers and routes new jobs to the least loaded one.
pub struct JobManager {
    workers: Vec<Worker>,
    paused: PauseState,
    event_tx: broadcast::Sender<JobEvent>,
    forwarders: Vec<JoinHandle<()>>,
}

impl JobManager {
    /// Validate `config`, then create and start `config.worker_count` workers,
    /// each with its own location `<root>/worker-<index>`.
    ///
    /// On error no workers are left running.
    pub async fn new(config: ManagerConfig, handler: Arc<dyn JobHandler>) -> Result<Self> {
        let root = config.validate()?;
        fs::create_dir_all(&root).await?;

        let worker_config = config.worker_config();
        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let id = format!("{WORKER_DIR_PREFIX}{index}");
            let location = root.join(&id);
            match Worker::start(id, location, handler.clone(), worker_config.clone()).await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    warn!(index, error = %e, "Failed to start worker, stopping pool");
                    for worker in &workers {
                        worker.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let forwarders = workers
            .iter()
            .map(|worker| tokio::spawn(forward_events(worker.events(), event_tx.clone())))
            .collect();

        info!(
            root = %root.display(),
            workers = workers.len(),
            max_retries = config.max_retries,
            paused = config.start_paused,
            "Job manager started"
        );

        Ok(Self {
            workers,
            paused: PauseState::new(config.start_paused),
            event_tx,
            forwarders,
        })
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job on the worker with the fewest jobs and return its id.
    ///
    /// Load is recomputed on every call; ties go to the lowest index.
    pub async fn enqueue(&self, arguments: JobArguments) -> String {
        let counts = join_all(self.workers.iter().map(Worker::job_count)).await;
        let index = least_loaded(&counts);
        let id = self.workers[index].enqueue(arguments);
        debug!(job_id = %id, worker_id = %self.workers[index].id(), "Job routed");
        id
    }

    /// Cancel a job that has not started, wherever it is stored.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let cancelled = join_all(self.workers.iter().map(|w| w.cancel(id))).await;
        if cancelled.into_iter().any(|c| c) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("job {id}")))
        }
    }

    /// Total jobs across all workers.
    pub async fn job_count(&self) -> usize {
        join_all(self.workers.iter().map(Worker::job_count))
            .await
            .into_iter()
            .sum()
    }

    /// Every stored job, worker by worker, each worker's jobs earliest due
    /// first.
    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        join_all(self.workers.iter().map(Worker::list_jobs))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// List every stored job on a separate task and hand the result to
    /// `callback`. Same order as [`JobManager::list_jobs`].
    pub fn list_all_jobs<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Vec<JobRecord>) + Send + 'static,
    {
        let stores: Vec<_> = self.workers.iter().map(|w| w.store().clone()).collect();
        tokio::spawn(async move {
            let mut jobs = Vec::new();
            for store in &stores {
                jobs.extend(list_sorted(store).await);
            }
            callback(jobs);
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_paused()
    }

    /// Pause or resume every worker.
    pub fn set_paused(&self, paused: bool) {
        self.paused.set(paused);
        for worker in &self.workers {
            worker.set_paused(paused);
        }
    }

    /// Get a receiver for job events from every worker.
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Stop every worker. In-flight attempts finish first.
    pub async fn shutdown(&self) {
        join_all(self.workers.iter().map(Worker::shutdown)).await;
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        info!("Job manager stopped");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

/// Index of the first smallest count.
fn least_loaded(counts: &[usize]) -> usize {
    counts
        .iter()
        .enumerate()
        .min_by_key(|(_, count)| **count)
        .map(|(index, _)| index)
        .unwrap_or(0)
}

async fn forward_events(
    mut rx: broadcast::Receiver<WorkerEvent>,
    tx: broadcast::Sender<JobEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(WorkerEvent::JobStarted { job_id, .. }) => JobEvent::Started(JobSnapshot::new(job_id)),
            Ok(WorkerEvent::JobFinished {
                job_id, outcome, ..
            }) => JobEvent::Finished {
                job: JobSnapshot::new(job_id),
                outcome,
            },
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged, events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let _ = tx.send(event);
    }
}

/// Builder for creating a job manager.
pub struct JobManagerBuilder {
    config: ManagerConfig,
    handler: Option<Arc<dyn JobHandler>>,
}

impl JobManagerBuilder {
    /// Create a new builder for the given storage root.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            config: ManagerConfig::new(storage_root),
            handler: None,
        }
    }

    /// Set the configuration. A config without a storage root keeps the
    /// builder's root.
    pub fn with_config(mut self, mut config: ManagerConfig) -> Self {
        if config.storage_root.is_none() {
            config.storage_root = self.config.storage_root.take();
        }
        self.config = config;
        self
    }

    /// Set the handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Set an already shared handler.
    pub fn with_shared_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build and start the manager.
    pub async fn build(self) -> Result<JobManager> {
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("a job handler is required".into()))?;
        JobManager::new(self.config, handler).await
    }
}
