//! Contract between the core and pluggable queue backends.

use async_trait::async_trait;

use crate::error::{DriverError, QueueError};
use crate::job::{JobId, JobRequest, QueuedJob};

/// Storage and transport backend the worker pool consumes.
///
/// Implementations must provide at-least-once delivery: an envelope handed
/// out by [`next_job`] that is never acknowledged may be delivered again.
/// Every operation may fail with [`DriverError`]; apart from
/// [`on_init`] the core logs the failure and keeps running, treating the
/// driver as the retry locus for its own I/O.
///
/// [`next_job`]: QueueDriver::next_job
/// [`on_init`]: QueueDriver::on_init
#[async_trait]
pub trait QueueDriver: Send + Sync + 'static {
    /// One-time initialisation, invoked exactly once before the first pull.
    ///
    /// Unlike every other operation, an error here aborts the worker pool.
    async fn on_init(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Durably enqueue a request, returning the assigned id.
    ///
    /// Must stay available while the driver is draining: retries and
    /// delayed re-enqueues arrive as pushes.
    async fn push(&self, request: &JobRequest) -> Result<JobId, DriverError>;

    /// Next envelope to execute.
    ///
    /// Blocks until work is available; returns `None` only after [`stop`]
    /// has been observed and the backlog has drained.
    ///
    /// [`stop`]: QueueDriver::stop
    async fn next_job(&self) -> Result<Option<QueuedJob>, DriverError>;

    /// Acknowledge successful completion. Idempotent.
    async fn finished(&self, id: &JobId) -> Result<(), DriverError>;

    /// Record a terminal failure. Idempotent.
    ///
    /// May itself be called from a cancelled task; implementations should
    /// tolerate that.
    async fn failed(&self, id: &JobId, error: &QueueError) -> Result<(), DriverError>;

    /// Read a durable metadata value.
    ///
    /// Keys beginning with `jobSchedule` are reserved for the core.
    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError>;

    /// Write a durable metadata value.
    async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), DriverError>;

    /// Stop handing out new envelopes; [`next_job`] drains the backlog and
    /// then yields `None`.
    ///
    /// [`next_job`]: QueueDriver::next_job
    async fn stop(&self);

    /// Final cleanup, called after the pull stream has ended.
    async fn shutdown_gracefully(&self) -> Result<(), DriverError> {
        Ok(())
    }
}
