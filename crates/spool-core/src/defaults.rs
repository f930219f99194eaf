//! Centralized default constants for spool.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration types and the `spoold` binary read these instead of defining
//! their own magic numbers.

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of workers in a manager's pool.
pub const WORKER_COUNT: usize = 1;

/// Default maximum retry count for failed jobs.
///
/// Zero means a failed job is deleted after its first attempt.
pub const MAX_RETRIES: u32 = 0;

/// Default fallback poll interval in seconds.
///
/// Storage-change notifications wake a worker as soon as a record is written.
/// Records scheduled in the future become due without any write, so this is
/// the upper bound on how late such a record is picked up.
pub const POLL_INTERVAL_SECS: u64 = 20;

/// Base delay for the cubic retry backoff (`base * retries^3`), in seconds.
pub const BACKOFF_BASE_SECS: u64 = 30;

/// Capacity of the worker and manager event broadcast channels.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// STORAGE LAYOUT
// =============================================================================

/// Prefix of a worker's location directory under the storage root.
pub const WORKER_DIR_PREFIX: &str = "worker-";

/// Staging area inside a worker location. Hidden from listings.
pub const STAGING_DIR: &str = ".staging";

/// Serialized argument payload inside a job container.
pub const ARGUMENTS_FILE: &str = "arguments.json";

/// Mutable schedule (next eligible time) inside a job container.
pub const SCHEDULE_FILE: &str = "schedule.json";

/// Directory of retry markers inside a job container.
pub const RETRIES_DIR: &str = "retries";

/// Claim marker present while an attempt or a cancel owns a job.
pub const CLAIM_FILE: &str = "claim";
