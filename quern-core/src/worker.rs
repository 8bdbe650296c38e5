//! Worker pool: drives concurrent job execution against a queue driver.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::backoff::RetryBackoff;
use crate::driver::QueueDriver;
use crate::error::{JobError, QueueError, Result};
use crate::job::{JobContext, JobId, JobName, JobRequest, QueuedJob};
use crate::metrics::{self, JobStatus};
use crate::queue::Queue;
use crate::registry::JobRegistry;

/// Tunables for the worker pool.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions.
    pub num_workers: usize,
    /// Retry delay policy.
    pub backoff: RetryBackoff,
    /// Pause after a failed pull before asking the driver again.
    pub pull_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            backoff: RetryBackoff::default(),
            pull_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Consumes a driver's envelope stream with bounded concurrency.
///
/// Retries never occupy a worker slot: a failed job with budget left is
/// re-pushed with `attempts + 1` and a backoff `delay_until`, and the
/// worker moves on.
pub struct WorkerPool<D: QueueDriver> {
    queue: Queue<D>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
}

impl<D: QueueDriver> WorkerPool<D> {
    pub fn new(queue: Queue<D>, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
        }
    }

    /// Run until the driver's envelope stream ends.
    ///
    /// Flipping `shutdown` to `true` calls [`QueueDriver::stop`]; in-flight
    /// jobs run to completion, the backlog drains, and the driver is shut
    /// down gracefully. Only an `on_init` failure is fatal.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let num_workers = self.config.num_workers.max(1);
        let driver = self.queue.driver();
        driver.on_init().await?;
        metrics::set_worker_count(num_workers);
        info!(num_workers, "worker pool starting");

        let stopper = {
            let driver = Arc::clone(driver);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                if shutdown.wait_for(|stop| *stop).await.is_ok() {
                    info!("shutdown requested, stopping driver intake");
                    driver.stop().await;
                }
            })
        };

        let runner = JobRunner {
            queue: self.queue.clone(),
            registry: Arc::clone(&self.registry),
            backoff: self.config.backoff,
        };

        let mut inflight: JoinSet<()> = JoinSet::new();
        loop {
            while inflight.len() >= num_workers {
                join_one(&mut inflight).await;
            }
            match driver.next_job().await {
                Ok(Some(envelope)) => {
                    let runner = runner.clone();
                    inflight.spawn(async move { runner.run(envelope).await });
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "failed to pull next job");
                    metrics::driver_error("next_job");
                    tokio::time::sleep(self.config.pull_retry_delay).await;
                }
            }
        }

        info!(
            inflight = inflight.len(),
            "envelope stream drained, waiting for in-flight jobs"
        );
        while !inflight.is_empty() {
            join_one(&mut inflight).await;
        }
        stopper.abort();

        if let Err(err) = driver.shutdown_gracefully().await {
            debug!(error = %err, "driver shutdown reported an error");
            metrics::driver_error("shutdown");
        }
        info!("worker pool stopped");
        Ok(())
    }
}

async fn join_one(inflight: &mut JoinSet<()>) {
    if let Some(Err(err)) = inflight.join_next().await {
        if err.is_panic() {
            error!(error = %err, "job task panicked");
        }
    }
}

/// Everything one envelope task needs; cheap to clone into the task.
struct JobRunner<D: QueueDriver> {
    queue: Queue<D>,
    registry: Arc<JobRegistry>,
    backoff: RetryBackoff,
}

impl<D: QueueDriver> Clone for JobRunner<D> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            registry: Arc::clone(&self.registry),
            backoff: self.backoff,
        }
    }
}

/// Decrements the processing meter on every exit path.
struct ProcessingGuard(JobName);

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        metrics::job_processing_done(self.0.as_str());
    }
}

impl<D: QueueDriver> JobRunner<D> {
    async fn run(self, envelope: QueuedJob) {
        let started = Instant::now();

        let request = match JobRequest::from_bytes(&envelope.buffer) {
            Ok(request) => request,
            Err(err) => {
                warn!(job_id = %envelope.id, error = %err, "discarding undecodable envelope");
                self.driver_failed(&envelope.id, &err).await;
                return;
            }
        };
        let name = request.name.clone();

        metrics::job_dequeued(name.as_str());
        let _processing = ProcessingGuard(name.clone());

        let prepared = match self.registry.prepare(&request) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(job_id = %envelope.id, name = %name, error = %err, "job failed to decode");
                self.driver_failed(&envelope.id, &err).await;
                metrics::job_terminal(
                    name.as_str(),
                    JobStatus::Failed,
                    started.elapsed().as_secs_f64(),
                );
                return;
            }
        };
        let max_retry_count = prepared.max_retry_count();

        // Not yet due: hand the request straight back and free the worker.
        if let Some(delay_until) = request.delay_until {
            if delay_until > Utc::now() {
                debug!(
                    job_id = %envelope.id,
                    name = %name,
                    %delay_until,
                    "requeueing job for later execution"
                );
                if let Err(err) = self.queue.push_request(request).await {
                    warn!(job_id = %envelope.id, error = %err, "failed to requeue delayed job");
                }
                return;
            }
        }

        let queued_for = Utc::now() - request.queued_at;
        metrics::observe_queued_wait(name.as_str(), queued_for.num_milliseconds() as f64 / 1000.0);

        let ctx = JobContext::new(envelope.id.clone(), name.clone(), request.attempts);
        let span = ctx.logger().clone();
        let outcome = prepared.invoke(ctx).instrument(span).await;

        match outcome {
            Ok(()) => {
                if let Err(err) = self.queue.driver().finished(&envelope.id).await {
                    debug!(job_id = %envelope.id, error = %err, "driver finished-ack error");
                    metrics::driver_error("finished");
                }
                debug!(job_id = %envelope.id, name = %name, "job succeeded");
                metrics::job_terminal(
                    name.as_str(),
                    JobStatus::Succeeded,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(JobError::Cancelled) => {
                warn!(job_id = %envelope.id, name = %name, "job cancelled");
                self.driver_failed(&envelope.id, &QueueError::Cancelled).await;
                metrics::job_terminal(
                    name.as_str(),
                    JobStatus::Cancelled,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(JobError::Failed(source)) if request.attempts < max_retry_count => {
                self.retry(&envelope.id, request, source).await;
            }
            Err(JobError::Failed(source)) => {
                warn!(
                    job_id = %envelope.id,
                    name = %name,
                    error = %source,
                    attempts = request.attempts,
                    "job failed, retries exhausted"
                );
                self.driver_failed(&envelope.id, &QueueError::Handler(source))
                    .await;
                metrics::job_terminal(
                    name.as_str(),
                    JobStatus::Failed,
                    started.elapsed().as_secs_f64(),
                );
            }
        }
    }

    /// Re-enqueue a failed job with an incremented attempt count and a
    /// jittered backoff delay. The original `queued_at` is preserved.
    async fn retry(&self, id: &JobId, request: JobRequest, source: anyhow::Error) {
        let attempt = request.attempts + 1;
        let delay = self.backoff.delay(attempt);
        let name = request.name.clone();
        let retry_request = JobRequest {
            attempts: attempt,
            delay_until: Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()),
            ..request
        };

        warn!(
            job_id = %id,
            name = %name,
            error = %source,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "job failed, scheduling retry"
        );
        if let Err(err) = self.queue.push_request(retry_request).await {
            warn!(job_id = %id, error = %err, "failed to re-enqueue retry");
        }
        metrics::job_retried(name.as_str());
    }

    async fn driver_failed(&self, id: &JobId, error: &QueueError) {
        if let Err(err) = self.queue.driver().failed(id, error).await {
            debug!(job_id = %id, error = %err, "driver failed-ack error");
            metrics::driver_error("failed");
        }
    }
}
