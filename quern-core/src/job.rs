//! Job identity and envelope types shared by producers, drivers, and workers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Name tag identifying a job type; unique within a registry.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Driver-assigned identifier for one queued envelope.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Producer-side record a driver persists for each push.
///
/// `attempts` counts prior execute invocations for this logical job; a
/// retry is a fresh request with `attempts + 1` and the original
/// `queued_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: JobName,
    /// Encoded payload bytes; opaque to the core.
    pub parameters: Vec<u8>,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
    /// Earliest instant the job may execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
}

impl JobRequest {
    pub fn new(name: JobName, parameters: Vec<u8>) -> Self {
        Self {
            name,
            parameters,
            queued_at: Utc::now(),
            attempts: 0,
            delay_until: None,
        }
    }

    /// Serialize into the recommended self-describing envelope encoding.
    ///
    /// Drivers are free to persist requests however they like as long as
    /// the fields round-trip; this codec is what the bundled drivers use.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(QueueError::EncodeFailed)
    }

    /// Parse an envelope buffer produced by [`JobRequest::to_bytes`].
    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        serde_json::from_slice(buffer).map_err(QueueError::DecodeFailed)
    }
}

/// Envelope delivered by a driver: the assigned id plus the opaque buffer.
#[derive(Clone, Debug)]
pub struct QueuedJob {
    pub id: JobId,
    pub buffer: Vec<u8>,
}

/// Options accepted by the queue façade on push.
#[derive(Clone, Copy, Debug, Default)]
pub struct PushOptions {
    /// Earliest instant the job may execute; `None` means immediately.
    pub delay_until: Option<DateTime<Utc>>,
}

/// Per-invocation capabilities handed to a job handler.
///
/// Lives for exactly one execute call.
#[derive(Clone, Debug)]
pub struct JobContext {
    job_id: JobId,
    name: JobName,
    attempt: u32,
    span: tracing::Span,
}

impl JobContext {
    pub fn new(job_id: JobId, name: JobName, attempt: u32) -> Self {
        let span = tracing::debug_span!("job", job_id = %job_id, name = %name, attempt);
        Self {
            job_id,
            name,
            attempt,
            span,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn name(&self) -> &JobName {
        &self.name
    }

    /// Zero on the first run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Structured logging target scoped to this invocation.
    pub fn logger(&self) -> &tracing::Span {
        &self.span
    }
}
