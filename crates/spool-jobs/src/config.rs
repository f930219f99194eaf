//! Manager, worker and retry configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spool_core::{defaults, Error, Result};

use crate::backoff::{BackoffStrategy, CubicBackoff};

/// Decides, per failed attempt, whether the failure counts toward the retry
/// budget.
pub type FailureCounter = Arc<dyn Fn() -> bool + Send + Sync>;

/// Retry behavior shared by every worker of a manager.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before a job is deleted.
    pub max_retries: u32,
    pub count_failures: FailureCounter,
    pub backoff: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    /// Ask the decision source whether this failure counts.
    pub fn counts_failure(&self) -> bool {
        (self.count_failures)()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            count_failures: Arc::new(|| true),
            backoff: Arc::new(CubicBackoff::default()),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Configuration for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fallback polling interval.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Whether the worker starts paused.
    pub paused: bool,
    /// Capacity of the worker's event channel.
    pub event_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(defaults::POLL_INTERVAL_SECS),
            retry: RetryPolicy::default(),
            paused: false,
            event_capacity: defaults::EVENT_BUS_CAPACITY,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }
}

/// Configuration for a [`JobManager`](crate::JobManager).
#[derive(Clone)]
pub struct ManagerConfig {
    /// Number of workers in the pool. Must be at least 1.
    pub worker_count: usize,
    /// Directory holding one location per worker. Required.
    pub storage_root: Option<PathBuf>,
    /// Failed attempts tolerated before a job is deleted.
    pub max_retries: u32,
    /// Fallback polling interval of every worker.
    pub poll_interval: Duration,
    /// Whether the pool starts paused.
    pub start_paused: bool,
    /// Capacity of the event channels.
    pub event_capacity: usize,
    pub backoff: Arc<dyn BackoffStrategy>,
    pub count_failures: FailureCounter,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            worker_count: defaults::WORKER_COUNT,
            storage_root: None,
            max_retries: retry.max_retries,
            poll_interval: Duration::from_secs(defaults::POLL_INTERVAL_SECS),
            start_paused: false,
            event_capacity: defaults::EVENT_BUS_CAPACITY,
            backoff: retry.backoff,
            count_failures: retry.count_failures,
        }
    }
}

impl ManagerConfig {
    /// Create a config for the given storage root with defaults elsewhere.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self::default().with_storage_root(storage_root)
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SPOOL_STORAGE_ROOT` | unset | Directory holding the worker locations |
    /// | `SPOOL_WORKERS` | `1` | Number of workers |
    /// | `SPOOL_MAX_RETRIES` | `0` | Retry budget per job |
    /// | `SPOOL_POLL_INTERVAL_SECS` | `20` | Fallback poll interval |
    /// | `SPOOL_START_PAUSED` | `false` | Start with processing paused |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ManagerConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(root) = lookup("SPOOL_STORAGE_ROOT").filter(|v| !v.is_empty()) {
            config.storage_root = Some(PathBuf::from(root));
        }

        if let Some(n) = lookup("SPOOL_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
            config.worker_count = n;
        }

        if let Some(n) = lookup("SPOOL_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
            config.max_retries = n;
        }

        if let Some(secs) = lookup("SPOOL_POLL_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            config.poll_interval = Duration::from_secs(secs);
        }

        config.start_paused = lookup("SPOOL_START_PAUSED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        config
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Replace the backoff strategy (cubic 30s by default).
    pub fn with_backoff<B: BackoffStrategy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Install the decision source consulted on every failed attempt.
    pub fn with_failure_counting<F>(mut self, decide: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.count_failures = Arc::new(decide);
        self
    }

    /// Count every failure (`true`) or none (`false`).
    pub fn with_failures_counted(self, counted: bool) -> Self {
        self.with_failure_counting(move || counted)
    }

    /// Check construction parameters, returning the storage root.
    pub fn validate(&self) -> Result<PathBuf> {
        if self.worker_count < 1 {
            return Err(Error::Config(format!(
                "worker count must be at least 1, got {}",
                self.worker_count
            )));
        }
        if self.event_capacity < 1 {
            return Err(Error::Config("event capacity must be at least 1".into()));
        }
        match &self.storage_root {
            Some(root) if !root.as_os_str().is_empty() => Ok(root.clone()),
            _ => Err(Error::Config("storage root is required".into())),
        }
    }

    /// The retry policy every worker shares.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            count_failures: self.count_failures.clone(),
            backoff: self.backoff.clone(),
        }
    }

    /// Per-worker configuration derived from this one.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            retry: self.retry_policy(),
            paused: self.start_paused,
            event_capacity: self.event_capacity,
        }
    }
}

impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("worker_count", &self.worker_count)
            .field("storage_root", &self.storage_root)
            .field("max_retries", &self.max_retries)
            .field("poll_interval", &self.poll_interval)
            .field("start_paused", &self.start_paused)
            .field("event_capacity", &self.event_capacity)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
