//! # spool-jobs
//!
//! Crash-recoverable background job queue backed by the filesystem.
//!
//! This crate provides:
//! - A fixed pool of workers, each owning one storage directory
//! - Least-loaded routing of new jobs across the pool
//! - Serial, due-time ordered processing per worker, woken by file change
//!   notifications with a polling fallback
//! - Retry bookkeeping on disk with a replaceable backoff strategy
//! - Lifecycle notifications via broadcast channels
//!
//! Every job is a directory on disk, so queued and retrying work survives a
//! process restart.
//!
//! ## Example
//!
//! ```ignore
//! use spool_jobs::{handler_fn, JobArguments, JobContext, JobManagerBuilder, JobResult, ManagerConfig};
//!
//! let manager = JobManagerBuilder::new("/var/lib/spool")
//!     .with_config(ManagerConfig::default().with_workers(4).with_max_retries(3))
//!     .with_handler(handler_fn(|ctx: JobContext| async move {
//!         println!("sending {:?}", ctx.arguments().get_str("to"));
//!         JobResult::Success
//!     }))
//!     .build()
//!     .await?;
//!
//! let mut events = manager.events();
//! let id = manager.enqueue(JobArguments::new().with("to", "ops@example.com")).await;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! manager.shutdown().await;
//! ```

pub mod backoff;
pub mod config;
pub mod handler;
pub mod manager;
pub mod pause;
pub mod store;
pub mod worker;

// Re-export core types
pub use spool_core::*;

pub use backoff::{BackoffStrategy, ConstantBackoff, CubicBackoff};
pub use config::{FailureCounter, ManagerConfig, RetryPolicy, WorkerConfig};
pub use handler::{handler_fn, FnHandler, JobContext, JobHandler, JobResult, NoOpHandler};
pub use manager::{JobEvent, JobManager, JobManagerBuilder};
pub use pause::PauseState;
pub use store::{select_next, JobRecord, JobStore};
pub use worker::{Worker, WorkerEvent};

/// Default maximum retries for failed jobs.
pub const DEFAULT_MAX_RETRIES: u32 = spool_core::defaults::MAX_RETRIES;

/// Default fallback polling interval (seconds).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = spool_core::defaults::POLL_INTERVAL_SECS;
