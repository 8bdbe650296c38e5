use thiserror::Error;

use crate::job::JobName;

/// Errors surfaced by the queue core.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("unrecognised job name: {0}")]
    UnrecognisedJob(JobName),

    #[error("failed to decode job payload: {0}")]
    DecodeFailed(#[source] serde_json::Error),

    #[error("failed to encode job payload: {0}")]
    EncodeFailed(#[source] serde_json::Error),

    #[error("job cancelled")]
    Cancelled,

    #[error("job handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("job already registered: {0}")]
    DuplicateRegistration(JobName),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Transport or persistence failure reported by a queue driver.
///
/// The core logs these and keeps running; the driver is the retry locus
/// for its own I/O.
#[derive(Error, Debug)]
#[error("queue driver error: {0}")]
pub struct DriverError(#[from] pub anyhow::Error);

/// Outcome of a single handler invocation.
#[derive(Error, Debug)]
pub enum JobError {
    /// The invocation observed task cancellation. Terminal, never retried.
    #[error("job cancelled")]
    Cancelled,

    /// Any other handler failure; participates in retry with backoff.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
