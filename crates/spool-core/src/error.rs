//! Error types for spool.

use thiserror::Error;

/// Result type alias using spool's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for spool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction parameters (worker count, handler, storage root)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found on any worker
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
