//! Job registration and name-keyed dispatch.
//!
//! The registry is the single polymorphism seam of the framework: wire
//! payloads come in as opaque bytes tagged with a [`JobName`], and come
//! out as a one-shot invocable already bound to the registered handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{JobError, QueueError, Result};
use crate::job::{JobContext, JobName, JobRequest};

/// A registerable job type.
///
/// Implementations declare their wire name, payload type, and retry
/// budget; the registry erases the payload type behind [`PreparedJob`].
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Wire name of this job type; must be unique within a registry.
    const NAME: &'static str;

    /// Decoded payload handed to [`execute`](JobHandler::execute).
    type Payload: Serialize + DeserializeOwned + Send + 'static;

    /// Upper bound on *additional* attempts beyond the first.
    fn max_retry_count(&self) -> u32 {
        0
    }

    async fn execute(
        &self,
        payload: Self::Payload,
        ctx: JobContext,
    ) -> std::result::Result<(), JobError>;
}

type PrepareFn = Box<dyn Fn(&[u8]) -> Result<PreparedJob> + Send + Sync>;

type InvokeFn =
    Box<dyn FnOnce(JobContext) -> BoxFuture<'static, std::result::Result<(), JobError>> + Send>;

/// Maps job names to their decoder and handler.
///
/// Populated before the worker pool runs, then shared immutably behind an
/// `Arc`; registration after that point is prevented by ownership.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<JobName, PrepareFn>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its wire name.
    pub fn register<H: JobHandler>(&mut self, handler: H) -> Result<()> {
        let name = JobName::new(H::NAME);
        if self.jobs.contains_key(&name) {
            return Err(QueueError::DuplicateRegistration(name));
        }

        let handler = Arc::new(handler);
        let prepare: PrepareFn = Box::new(move |parameters| {
            let payload: H::Payload =
                serde_json::from_slice(parameters).map_err(QueueError::DecodeFailed)?;
            let handler = Arc::clone(&handler);
            Ok(PreparedJob {
                name: JobName::new(H::NAME),
                max_retry_count: handler.max_retry_count(),
                invoke: Box::new(move |ctx| {
                    Box::pin(async move { handler.execute(payload, ctx).await })
                }),
            })
        });

        self.jobs.insert(name, prepare);
        Ok(())
    }

    /// Decode a delivered request into an invocable bound to its handler.
    ///
    /// Fails with [`QueueError::UnrecognisedJob`] when the name was never
    /// registered and [`QueueError::DecodeFailed`] when the payload bytes
    /// do not parse; both are terminal for the envelope.
    pub fn prepare(&self, request: &JobRequest) -> Result<PreparedJob> {
        let prepare = self
            .jobs
            .get(&request.name)
            .ok_or_else(|| QueueError::UnrecognisedJob(request.name.clone()))?;
        prepare(&request.parameters)
    }

    pub fn contains(&self, name: &JobName) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.jobs.keys().map(JobName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("JobRegistry").field("jobs", &names).finish()
    }
}

/// A decoded job bound to its handler, ready to run exactly once.
pub struct PreparedJob {
    name: JobName,
    max_retry_count: u32,
    invoke: InvokeFn,
}

impl PreparedJob {
    pub fn name(&self) -> &JobName {
        &self.name
    }

    /// Retry budget registered for this job type.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Run the handler; consumes the prepared job.
    pub async fn invoke(self, ctx: JobContext) -> std::result::Result<(), JobError> {
        (self.invoke)(ctx).await
    }
}

impl fmt::Debug for PreparedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedJob")
            .field("name", &self.name)
            .field("max_retry_count", &self.max_retry_count)
            .finish()
    }
}
