//! Error types for the limiter and its datastores

use thiserror::Error;

/// Errors surfaced by limiter construction, submission, and the datastores
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// A shared datastore was configured without a limiter ID.
    #[error("limiter ID is required when a shared datastore is configured")]
    MissingId,

    /// A job was submitted with a zero weight.
    #[error("job weight must be positive")]
    InvalidWeight,

    /// The datastore was disconnected, or the limiter was stopped.
    #[error("store is closed")]
    StoreClosed,

    /// The Redis medium failed; propagated verbatim from the client.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A third-party datastore's medium failed.
    #[error("datastore error: {0}")]
    Store(eyre::Report),

    /// The submitted work itself returned an error.
    #[error("job failed: {0}")]
    Job(eyre::Report),
}

impl ThrottleError {
    /// Check whether this is a lifecycle rejection rather than a job failure
    pub fn is_store_closed(&self) -> bool {
        matches!(self, ThrottleError::StoreClosed)
    }

    /// Extract the job's own error, if this wraps one
    pub fn into_job_error(self) -> Option<eyre::Report> {
        match self {
            ThrottleError::Job(report) => Some(report),
            _ => None,
        }
    }
}
