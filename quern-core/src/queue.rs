//! Producer façade over a queue driver.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::driver::QueueDriver;
use crate::error::{QueueError, Result};
use crate::job::{JobId, JobName, JobRequest, PushOptions};
use crate::metrics;
use crate::registry::JobHandler;

/// Hook invoked after every successful push.
///
/// Runs for producer pushes, scheduler firings, and worker re-enqueues
/// alike, in registration order.
#[async_trait]
pub trait PushMiddleware: Send + Sync {
    async fn on_push(&self, request: &JobRequest, id: &JobId);
}

/// Cloneable producer handle; clones share the driver and middleware.
pub struct Queue<D> {
    driver: Arc<D>,
    middleware: Arc<Vec<Arc<dyn PushMiddleware>>>,
}

impl<D> Clone for Queue<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            middleware: Arc::clone(&self.middleware),
        }
    }
}

impl<D> fmt::Debug for Queue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("driver", &std::any::type_name::<D>())
            .field("middleware_count", &self.middleware.len())
            .finish()
    }
}

impl<D: QueueDriver> Queue<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            middleware: Arc::new(Vec::new()),
        }
    }

    /// Attach a push hook. Builder-style; call before handing clones out
    /// to the worker pool or scheduler.
    pub fn with_middleware(mut self, middleware: Arc<dyn PushMiddleware>) -> Self {
        Arc::make_mut(&mut self.middleware).push(middleware);
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Encode and enqueue a job for immediate execution.
    pub async fn push<H: JobHandler>(&self, payload: &H::Payload) -> Result<JobId> {
        self.push_with::<H>(payload, PushOptions::default()).await
    }

    /// Encode and enqueue a job with explicit options.
    pub async fn push_with<H: JobHandler>(
        &self,
        payload: &H::Payload,
        options: PushOptions,
    ) -> Result<JobId> {
        let parameters = serde_json::to_vec(payload).map_err(QueueError::EncodeFailed)?;
        let request = JobRequest {
            name: JobName::new(H::NAME),
            parameters,
            queued_at: Utc::now(),
            attempts: 0,
            delay_until: options.delay_until,
        };
        self.push_request(request).await
    }

    /// Enqueue a fully-formed request.
    ///
    /// Scheduler firings and worker re-enqueues land here too, so the
    /// queued meter and middleware chain see every push uniformly.
    pub async fn push_request(&self, request: JobRequest) -> Result<JobId> {
        let id = self.driver.push(&request).await.map_err(|err| {
            metrics::driver_error("push");
            QueueError::from(err)
        })?;

        metrics::job_queued(request.name.as_str());
        for hook in self.middleware.iter() {
            hook.on_push(&request, &id).await;
        }
        debug!(
            job_id = %id,
            name = %request.name,
            attempts = request.attempts,
            delayed = request.delay_until.is_some(),
            "queued job"
        );
        Ok(id)
    }
}
