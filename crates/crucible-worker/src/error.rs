//! Worker protocol errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process could not be spawned or is gone.
    #[error("compiler worker unavailable: {reason}")]
    Unavailable { reason: String },

    /// A job received no response within the bound.
    #[error("compilation timed out")]
    Timeout,

    /// A wire message could not be encoded or decoded.
    #[error("worker protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The service actor is gone; no further jobs can be submitted.
    #[error("worker service stopped")]
    ServiceStopped,
}
