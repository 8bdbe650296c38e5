//! # Quern Core
//!
//! Core of the Quern background-job framework: a worker pool that executes
//! jobs pulled from a pluggable queue driver, and a calendar scheduler
//! that feeds the same queue at programmed instants.
//!
//! ## Overview
//!
//! - **Registry**: maps job names to typed handlers; the single
//!   polymorphism seam between wire payloads and application code
//! - **Worker pool**: up to `num_workers` concurrent executions, retries
//!   re-pushed with full-jitter backoff instead of holding a worker slot
//! - **Scheduler**: minute/hourly/daily/weekly/monthly recurrences with a
//!   persisted cursor, so missed firings replay after a restart
//! - **Driver contract**: push / pull / ack / metadata / lifecycle; any
//!   backend providing at-least-once delivery plugs in
//! - **Metrics**: Prometheus gauges, counters, and histograms for every
//!   status transition
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use quern_core::{
//!     JobContext, JobError, JobHandler, JobRegistry, Queue, WorkerConfig, WorkerPool,
//!     async_trait,
//! };
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     const NAME: &'static str = "send-email";
//!     type Payload = String;
//!
//!     fn max_retry_count(&self) -> u32 {
//!         3
//!     }
//!
//!     async fn execute(&self, to: String, _ctx: JobContext) -> Result<(), JobError> {
//!         deliver(&to).await.map_err(JobError::from)
//!     }
//! }
//!
//! async fn serve(driver: Arc<impl quern_core::QueueDriver>) -> quern_core::Result<()> {
//!     let mut registry = JobRegistry::new();
//!     registry.register(SendEmail)?;
//!
//!     let queue = Queue::new(driver);
//!     queue.push::<SendEmail>(&"ops@example.com".to_owned()).await?;
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     WorkerPool::new(queue, Arc::new(registry), WorkerConfig::default())
//!         .run(shutdown_rx)
//!         .await
//! }
//! ```

/// Retry delay policy.
pub mod backoff;

/// Contract between the core and pluggable queue backends.
pub mod driver;

/// Error types shared across the framework.
pub mod error;

/// Job identity, envelopes, and per-invocation context.
pub mod job;

/// Prometheus instruments for the job lifecycle.
pub mod metrics;

/// Producer façade and push middleware.
pub mod queue;

/// Job registration and name-keyed dispatch.
pub mod registry;

/// Recurrence rules and next-fire arithmetic.
pub mod schedule;

/// The calendar scheduler service.
pub mod scheduler;

/// The worker pool.
pub mod worker;

#[cfg(test)]
mod test_support;

pub use async_trait::async_trait;

pub use backoff::RetryBackoff;
pub use driver::QueueDriver;
pub use error::{DriverError, JobError, QueueError, Result};
pub use job::{JobContext, JobId, JobName, JobRequest, PushOptions, QueuedJob};
pub use queue::{PushMiddleware, Queue};
pub use registry::{JobHandler, JobRegistry, PreparedJob};
pub use schedule::Schedule;
pub use scheduler::{JobScheduler, SCHEDULE_CURSOR_KEY, ScheduleAccuracy, ScheduleEntry};
pub use worker::{WorkerConfig, WorkerPool};
