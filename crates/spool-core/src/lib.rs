//! # spool-core
//!
//! Core types and shared constants for the spool job queue.
//!
//! This crate holds everything that does not touch the filesystem or the
//! async runtime: the error type, the default values every other crate reads,
//! and the job argument/snapshot models handed across the public API.

pub mod defaults;
pub mod error;
pub mod models;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::{JobArguments, JobOutcome, JobSnapshot};
