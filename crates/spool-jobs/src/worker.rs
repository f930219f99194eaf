//! Job worker: one storage location, one serial processing loop.
//!
//! A worker runs two background tasks:
//!
//! - the **writer**, which creates records handed over by `enqueue` one at a
//!   time, in the order they were enqueued;
//! - the **loop**, which drains eligible records one attempt at a time.
//!
//! The loop is woken by a filesystem watcher on the location, by a fallback
//! poll timer, and by explicit triggers (after a record is written, after a
//! cancel, on resume, at startup). Triggers go through a capacity-1 channel,
//! so triggers arriving while a drain is running collapse into a single
//! follow-up pass.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use spool_core::{JobArguments, JobOutcome, Result};

use crate::config::{RetryPolicy, WorkerConfig};
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::pause::PauseState;
use crate::store::{select_next, JobRecord, JobStore};

/// Event emitted by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// An attempt is about to invoke the handler.
    JobStarted { worker_id: String, job_id: String },
    /// An attempt returned and its record was updated.
    JobFinished {
        worker_id: String,
        job_id: String,
        outcome: JobOutcome,
    },
    /// Worker loop started.
    WorkerStarted { worker_id: String },
    /// Worker loop stopped.
    WorkerStopped { worker_id: String },
}

/// A job accepted by `enqueue` and waiting for the writer.
struct PendingJob {
    id: String,
    arguments: JobArguments,
}

struct WorkerInner {
    id: String,
    store: JobStore,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
    paused: PauseState,
    current_job: RwLock<Option<String>>,
    /// Ids accepted by `enqueue` but not yet written by the writer.
    pending: StdMutex<HashSet<String>>,
    trigger_tx: mpsc::Sender<()>,
    create_tx: mpsc::UnboundedSender<PendingJob>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

/// Handle to a running worker.
pub struct Worker {
    inner: Arc<WorkerInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Prepare `location`, start the writer and the processing loop, and
    /// request an initial drain.
    pub async fn start(
        id: impl Into<String>,
        location: impl Into<PathBuf>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Result<Self> {
        let id = id.into();
        let store = JobStore::new(location);
        store.init().await?;

        match store.recover().await {
            Ok(0) => {}
            Ok(cleaned) => info!(worker_id = %id, cleaned, "Recovered leftovers from previous run"),
            Err(e) => warn!(worker_id = %id, error = %e, "Failed to recover worker location"),
        }

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (create_tx, create_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = watch_location(&id, store.location(), trigger_tx.clone());

        let inner = Arc::new(WorkerInner {
            id,
            store,
            handler,
            retry: config.retry,
            paused: PauseState::new(config.paused),
            current_job: RwLock::new(None),
            pending: StdMutex::new(HashSet::new()),
            trigger_tx,
            create_tx,
            event_tx,
        });

        // `interval` panics on a zero period.
        let poll_interval = config.poll_interval.max(Duration::from_millis(1));

        let run = tokio::spawn(inner.clone().run(
            trigger_rx,
            shutdown_rx.clone(),
            poll_interval,
            watcher,
        ));
        let write = tokio::spawn(inner.clone().write_loop(create_rx, shutdown_rx));

        inner.trigger();

        Ok(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(vec![run, write]),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Directory holding this worker's records.
    pub fn location(&self) -> &Path {
        self.inner.store.location()
    }

    pub(crate) fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Accept a job and return its id.
    ///
    /// The record is written by the worker's writer task after this returns.
    /// If it cannot be written the id is still returned, but the job never
    /// becomes visible.
    pub fn enqueue(&self, arguments: JobArguments) -> String {
        let id = Uuid::now_v7().to_string();
        self.inner.pending().insert(id.clone());

        let job = PendingJob {
            id: id.clone(),
            arguments,
        };
        if self.inner.create_tx.send(job).is_err() {
            self.inner.pending().remove(&id);
            warn!(worker_id = %self.inner.id, job_id = %id, "Writer stopped, job will not be persisted");
        } else {
            debug!(worker_id = %self.inner.id, job_id = %id, "Job enqueued");
        }
        id
    }

    /// Remove a job that has not started.
    ///
    /// Returns `false` if the job is not stored here or an attempt already
    /// owns it. A running attempt is never interrupted.
    pub async fn cancel(&self, id: &str) -> bool {
        let inner = &self.inner;

        if inner.current_job.read().await.as_deref() == Some(id) {
            debug!(worker_id = %inner.id, job_id = %id, "Job is in flight, not cancelling");
            return false;
        }

        match inner.store.list().await {
            Ok(records) if records.iter().any(|r| r.id() == id) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(worker_id = %inner.id, error = %e, "Failed to list jobs for cancel");
                return false;
            }
        }

        match inner.store.claim(id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker_id = %inner.id, job_id = %id, "Job already claimed, not cancelling");
                return false;
            }
            Err(e) => {
                warn!(worker_id = %inner.id, job_id = %id, error = %e, "Failed to claim job for cancel");
                return false;
            }
        }

        if let Err(e) = inner.store.delete(id).await {
            warn!(worker_id = %inner.id, job_id = %id, error = %e, "Failed to delete cancelled job");
            inner.release(id).await;
            return false;
        }

        info!(worker_id = %inner.id, job_id = %id, "Job cancelled");
        inner.trigger();
        true
    }

    /// Stored records plus records accepted but not yet written.
    ///
    /// The stored part is a directory count, so it includes records another
    /// process wrote into the location. Ids handed out by [`Worker::enqueue`]
    /// whose records the writer has not published yet are added on top: the
    /// manager routes on this number, and without them a burst of enqueues
    /// would see stale load and pile onto one worker. A job whose write fails
    /// stops being counted once the writer gives up on it.
    pub async fn job_count(&self) -> usize {
        // Snapshot pending first: an id that leaves the set before the
        // snapshot is already visible to the directory read that follows.
        let mut ids = self.inner.pending().clone();
        match self.inner.store.job_names().await {
            Ok(names) => ids.extend(names),
            Err(e) => warn!(worker_id = %self.inner.id, error = %e, "Failed to count jobs"),
        }
        ids.len()
    }

    /// Every stored record, including ones not yet due, earliest first.
    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        list_sorted(&self.inner.store).await
    }

    /// List every stored record on a separate task and hand the result to
    /// `callback`. Never waits on the processing loop.
    pub fn list_all_jobs<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Vec<JobRecord>) + Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::spawn(async move {
            callback(list_sorted(&store).await);
        })
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.is_paused()
    }

    /// Pause or resume. Resuming immediately requests a drain.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.set(paused);
        if !paused {
            self.inner.trigger();
        }
    }

    /// Id of the job whose attempt is in flight, if any.
    pub async fn current_job(&self) -> Option<String> {
        self.inner.current_job.read().await.clone()
    }

    /// Request a drain now.
    pub fn trigger(&self) {
        self.inner.trigger();
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Stop the loop after the in-flight attempt and the writer after it has
    /// written everything already accepted.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(worker_id = %self.inner.id, error = ?e, "Worker task panicked");
            }
        }
    }
}

impl WorkerInner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger(&self) {
        if self.trigger_tx.try_send(()).is_err() {
            trace!(worker_id = %self.id, "Trigger coalesced");
        }
    }

    /// Processing loop: wait for a wake-up, then drain unless paused.
    #[instrument(skip_all, fields(worker_id = %self.id))]
    async fn run(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
        poll_interval: Duration,
        _watcher: Option<RecommendedWatcher>,
    ) {
        info!(
            location = %self.store.location().display(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted {
            worker_id: self.id.clone(),
        });

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(()) = trigger_rx.recv() => trace!("Woken by trigger"),
                _ = ticker.tick() => trace!("Woken by poll timer"),
            }

            if self.paused.is_paused() {
                trace!("Paused, ignoring wake-up");
                continue;
            }
            self.drain(&shutdown_rx).await;
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped {
            worker_id: self.id.clone(),
        });
        info!("Worker stopped");
    }

    /// Attempt eligible records, earliest due first, until none remain.
    ///
    /// A record attempted during this pass is not attempted again in the same
    /// pass; if it is still eligible it waits for the next wake-up.
    async fn drain(&self, shutdown_rx: &watch::Receiver<bool>) {
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            if self.paused.is_paused() || *shutdown_rx.borrow() {
                break;
            }

            let records = match self.store.list().await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "Failed to list jobs");
                    break;
                }
            };

            let Some(record) = select_next(&records, Utc::now(), &attempted).cloned() else {
                trace!(record_count = records.len(), "No eligible jobs, idle");
                break;
            };
            attempted.insert(record.id().to_string());

            match self.store.claim(record.id()).await {
                Ok(true) => self.attempt(record).await,
                Ok(false) => debug!(job_id = %record.id(), "Job claimed elsewhere, skipping"),
                Err(e) => warn!(job_id = %record.id(), error = %e, "Failed to claim job"),
            }
        }
    }

    /// Run one claimed record through the handler and apply the outcome.
    async fn attempt(&self, record: JobRecord) {
        let start = Instant::now();
        let job_id = record.id().to_string();

        *self.current_job.write().await = Some(job_id.clone());
        debug!(%job_id, retry_count = record.retry_count(), "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            worker_id: self.id.clone(),
            job_id: job_id.clone(),
        });

        let result = self
            .handler
            .execute(JobContext::new(record.clone(), self.id.clone()))
            .await;
        let outcome = result.outcome();

        match result {
            JobResult::Success => {
                if let Err(e) = self.store.delete(&job_id).await {
                    error!(%job_id, error = %e, "Failed to delete completed job");
                    self.release(&job_id).await;
                }
                info!(
                    %job_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
            }
            JobResult::Failed(reason) => self.handle_failure(&record, &reason).await,
        }

        let _ = self.event_tx.send(WorkerEvent::JobFinished {
            worker_id: self.id.clone(),
            job_id,
            outcome,
        });
        *self.current_job.write().await = None;
    }

    async fn handle_failure(&self, record: &JobRecord, reason: &str) {
        let job_id = record.id();

        if !self.retry.counts_failure() {
            debug!(%job_id, %reason, "Job failed, failure not counted toward retries");
            self.release(job_id).await;
            return;
        }

        let retry_count = match self.store.retry_count(job_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%job_id, error = %e, "Failed to read retry markers, using last known count");
                record.retry_count()
            }
        };

        if retry_count >= self.retry.max_retries {
            warn!(%job_id, retry_count, %reason, "Job failed, retries exhausted");
            if let Err(e) = self.store.delete(job_id).await {
                error!(%job_id, error = %e, "Failed to delete exhausted job");
                self.release(job_id).await;
            }
            return;
        }

        match self
            .store
            .increment_retry(job_id, self.retry.backoff.as_ref())
            .await
        {
            Ok(Some(updated)) => warn!(
                %job_id,
                retry_count = updated.retry_count(),
                next_eligible_at = %updated.next_eligible_at(),
                %reason,
                "Job failed, rescheduled"
            ),
            Ok(None) => debug!(%job_id, "Job removed during attempt, nothing to reschedule"),
            Err(e) => error!(%job_id, error = %e, "Failed to reschedule job"),
        }
        self.release(job_id).await;
    }

    async fn release(&self, job_id: &str) {
        if let Err(e) = self.store.release(job_id).await {
            warn!(worker_id = %self.id, %job_id, error = %e, "Failed to release claim");
        }
    }

    /// Writer: create accepted records one at a time, in order.
    async fn write_loop(
        self: Arc<Self>,
        mut create_rx: mpsc::UnboundedReceiver<PendingJob>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                job = create_rx.recv() => match job {
                    Some(job) => self.write(job).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    while let Ok(job) = create_rx.try_recv() {
                        self.write(job).await;
                    }
                    break;
                }
            }
        }
    }

    async fn write(&self, job: PendingJob) {
        match self.store.create(&job.id, &job.arguments).await {
            Ok(_) => trace!(worker_id = %self.id, job_id = %job.id, "Job record written"),
            Err(e) => warn!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %e,
                "Failed to write job record, job dropped"
            ),
        }
        self.pending().remove(&job.id);
        self.trigger();
    }
}

pub(crate) async fn list_sorted(store: &JobStore) -> Vec<JobRecord> {
    let mut records = match store.list().await {
        Ok(records) => records,
        Err(e) => {
            warn!(location = %store.location().display(), error = %e, "Failed to list jobs");
            Vec::new()
        }
    };
    records.sort_by(|a, b| {
        a.next_eligible_at()
            .cmp(&b.next_eligible_at())
            .then_with(|| a.id().cmp(b.id()))
    });
    records
}

/// Watch `location` (non-recursively) and turn every change into a trigger.
///
/// Returns `None` if the platform watcher cannot be created; the worker then
/// relies on the poll timer alone.
fn watch_location(
    worker_id: &str,
    location: &Path,
    trigger_tx: mpsc::Sender<()>,
) -> Option<RecommendedWatcher> {
    let watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if result.is_ok() {
                let _ = trigger_tx.try_send(());
            }
        },
        Config::default(),
    )
    .and_then(|mut watcher| {
        watcher.watch(location, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    });

    match watcher {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(%worker_id, error = %e, "File watcher unavailable, falling back to polling");
            None
        }
    }
}
