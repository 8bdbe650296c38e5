//! Test doubles shared by the worker and scheduler unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::driver::QueueDriver;
use crate::error::{DriverError, QueueError};
use crate::job::{JobId, JobRequest, QueuedJob};

/// Scripted driver: hands out a fixed set of envelopes, then ends the
/// stream. Records every push and acknowledgement for assertions.
#[derive(Default)]
pub struct ScriptedDriver {
    pub deliveries: Mutex<VecDeque<QueuedJob>>,
    pub pushed: Mutex<Vec<JobRequest>>,
    pub finished: Mutex<Vec<JobId>>,
    pub failed: Mutex<Vec<(JobId, String)>>,
    pub metadata: Mutex<HashMap<String, Vec<u8>>>,
}

impl ScriptedDriver {
    pub fn with_envelopes(envelopes: impl IntoIterator<Item = QueuedJob>) -> Self {
        Self {
            deliveries: Mutex::new(envelopes.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn envelope(id: &str, request: &JobRequest) -> QueuedJob {
        QueuedJob {
            id: JobId::new(id),
            buffer: request.to_bytes().expect("encode test envelope"),
        }
    }
}

#[async_trait]
impl QueueDriver for ScriptedDriver {
    async fn push(&self, request: &JobRequest) -> Result<JobId, DriverError> {
        let mut pushed = self.pushed.lock().expect("pushed mutex");
        pushed.push(request.clone());
        Ok(JobId::new(format!("pushed-{}", pushed.len())))
    }

    async fn next_job(&self) -> Result<Option<QueuedJob>, DriverError> {
        Ok(self.deliveries.lock().expect("deliveries mutex").pop_front())
    }

    async fn finished(&self, id: &JobId) -> Result<(), DriverError> {
        self.finished.lock().expect("finished mutex").push(id.clone());
        Ok(())
    }

    async fn failed(&self, id: &JobId, error: &QueueError) -> Result<(), DriverError> {
        self.failed
            .lock()
            .expect("failed mutex")
            .push((id.clone(), error.to_string()));
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(self.metadata.lock().expect("metadata mutex").get(key).cloned())
    }

    async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), DriverError> {
        self.metadata
            .lock()
            .expect("metadata mutex")
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn stop(&self) {}
}
