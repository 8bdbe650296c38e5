//! In-process queue driver for Quern.
//!
//! Backs local development and the integration test suite: at-least-once
//! delivery within a single process, native handling of delayed requests,
//! and a drain-aware `stop`. Not a durability story; everything is lost
//! with the process.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quern_core::{DriverError, JobId, JobRequest, QueueDriver, QueueError, QueuedJob};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    ready: VecDeque<QueuedJob>,
    /// Keyed by (due instant, push sequence) so equal due times keep
    /// their push order.
    delayed: BTreeMap<(DateTime<Utc>, u64), QueuedJob>,
    sequence: u64,
    metadata: HashMap<String, Vec<u8>>,
    pushed: Vec<JobRequest>,
    finished: Vec<JobId>,
    failed: Vec<(JobId, String)>,
    acked: HashSet<JobId>,
}

impl State {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some((&(due, sequence), _)) = self.delayed.first_key_value() {
            if due > now {
                break;
            }
            if let Some(job) = self.delayed.remove(&(due, sequence)) {
                self.ready.push_back(job);
            }
        }
    }
}

/// In-memory queue driver.
///
/// Delivery removes the envelope from the queue, so a worker-side re-push
/// never duplicates it; `finished`/`failed` are idempotent bookkeeping.
#[derive(Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
    notify: Notify,
    stopped: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently queued, ready plus delayed.
    pub fn depth(&self) -> usize {
        let state = self.state.lock().expect("state mutex");
        state.ready.len() + state.delayed.len()
    }

    /// Every request accepted by [`QueueDriver::push`], in order.
    pub fn pushed(&self) -> Vec<JobRequest> {
        self.state.lock().expect("state mutex").pushed.clone()
    }

    /// Ids acknowledged as successfully completed.
    pub fn finished_ids(&self) -> Vec<JobId> {
        self.state.lock().expect("state mutex").finished.clone()
    }

    /// Terminally failed ids with their error text.
    pub fn failed_jobs(&self) -> Vec<(JobId, String)> {
        self.state.lock().expect("state mutex").failed.clone()
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    async fn push(&self, request: &JobRequest) -> Result<JobId, DriverError> {
        let id = JobId::new(Uuid::now_v7().to_string());
        let buffer = request
            .to_bytes()
            .map_err(|err| DriverError(anyhow::Error::new(err)))?;
        let job = QueuedJob {
            id: id.clone(),
            buffer,
        };

        {
            let mut state = self.state.lock().expect("state mutex");
            state.pushed.push(request.clone());
            match request.delay_until {
                Some(due) if due > Utc::now() => {
                    state.sequence += 1;
                    let key = (due, state.sequence);
                    state.delayed.insert(key, job);
                }
                _ => state.ready.push_back(job),
            }
        }
        self.notify.notify_one();
        debug!(job_id = %id, name = %request.name, "accepted job");
        Ok(id)
    }

    async fn next_job(&self) -> Result<Option<QueuedJob>, DriverError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock().expect("state mutex");
                state.promote_due(Utc::now());
                if let Some(job) = state.ready.pop_front() {
                    return Ok(Some(job));
                }
                if self.stopped.load(Ordering::SeqCst) {
                    // Draining; delayed jobs that never came due are
                    // dropped with the queue.
                    return Ok(None);
                }
                state.delayed.first_key_value().map(|(&(due, _), _)| due)
            };

            match next_due {
                Some(due) => {
                    let wait = (due - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn finished(&self, id: &JobId) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("state mutex");
        if state.acked.insert(id.clone()) {
            state.finished.push(id.clone());
        }
        Ok(())
    }

    async fn failed(&self, id: &JobId, error: &QueueError) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("state mutex");
        if state.acked.insert(id.clone()) {
            state.failed.push((id.clone(), error.to_string()));
        }
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(self
            .state
            .lock()
            .expect("state mutex")
            .metadata
            .get(key)
            .cloned())
    }

    async fn set_metadata(&self, key: &str, value: &[u8]) -> Result<(), DriverError> {
        self.state
            .lock()
            .expect("state mutex")
            .metadata
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn shutdown_gracefully(&self) -> Result<(), DriverError> {
        debug!(remaining = self.depth(), "memory driver shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quern_core::JobName;
    use tokio::time::timeout;

    use super::*;

    fn request(name: &str) -> JobRequest {
        JobRequest::new(JobName::new(name), b"{}".to_vec())
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_the_envelope() {
        let driver = MemoryDriver::new();
        let id = driver.push(&request("a")).await.expect("push");

        let job = driver
            .next_job()
            .await
            .expect("pull")
            .expect("job available");
        assert_eq!(job.id, id);

        let decoded = JobRequest::from_bytes(&job.buffer).expect("decode");
        assert_eq!(decoded.name.as_str(), "a");
        assert_eq!(driver.depth(), 0);
    }

    #[tokio::test]
    async fn pull_blocks_until_a_push_arrives() {
        let driver = std::sync::Arc::new(MemoryDriver::new());

        let puller = {
            let driver = std::sync::Arc::clone(&driver);
            tokio::spawn(async move { driver.next_job().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!puller.is_finished(), "pull must block while empty");

        driver.push(&request("late")).await.expect("push");
        let job = timeout(Duration::from_secs(1), puller)
            .await
            .expect("pull must wake")
            .expect("join")
            .expect("pull")
            .expect("job available");
        let decoded = JobRequest::from_bytes(&job.buffer).expect("decode");
        assert_eq!(decoded.name.as_str(), "late");
    }

    #[tokio::test]
    async fn delayed_jobs_are_withheld_until_due() {
        let driver = MemoryDriver::new();
        let mut delayed = request("later");
        delayed.delay_until = Some(Utc::now() + chrono::Duration::milliseconds(150));
        driver.push(&delayed).await.expect("push");

        let before = std::time::Instant::now();
        let job = timeout(Duration::from_secs(2), driver.next_job())
            .await
            .expect("must become due")
            .expect("pull")
            .expect("job available");
        assert!(before.elapsed() >= Duration::from_millis(140));

        let decoded = JobRequest::from_bytes(&job.buffer).expect("decode");
        assert_eq!(decoded.name.as_str(), "later");
    }

    #[tokio::test]
    async fn stop_drains_the_backlog_then_ends_the_stream() {
        let driver = MemoryDriver::new();
        driver.push(&request("a")).await.expect("push");
        driver.push(&request("b")).await.expect("push");
        driver.stop().await;

        assert!(driver.next_job().await.expect("pull").is_some());
        assert!(driver.next_job().await.expect("pull").is_some());
        assert!(driver.next_job().await.expect("pull").is_none());
    }

    #[tokio::test]
    async fn stop_wakes_a_blocked_puller() {
        let driver = std::sync::Arc::new(MemoryDriver::new());
        let puller = {
            let driver = std::sync::Arc::clone(&driver);
            tokio::spawn(async move { driver.next_job().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.stop().await;

        let end = timeout(Duration::from_secs(1), puller)
            .await
            .expect("stop must wake the puller")
            .expect("join")
            .expect("pull");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn acknowledgements_are_idempotent() {
        let driver = MemoryDriver::new();
        let id = JobId::new("once");
        driver.finished(&id).await.expect("finish");
        driver.finished(&id).await.expect("finish again");
        driver
            .failed(&id, &QueueError::Cancelled)
            .await
            .expect("late failure report");

        assert_eq!(driver.finished_ids().len(), 1);
        assert!(driver.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let driver = MemoryDriver::new();
        assert!(driver.get_metadata("cursor").await.expect("get").is_none());

        driver
            .set_metadata("cursor", b"2024-01-01T00:00:00Z")
            .await
            .expect("set");
        assert_eq!(
            driver.get_metadata("cursor").await.expect("get").as_deref(),
            Some(b"2024-01-01T00:00:00Z".as_slice())
        );
    }
}
