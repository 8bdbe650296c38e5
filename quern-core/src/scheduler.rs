//! Calendar scheduler: fires recurring jobs onto a queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::driver::QueueDriver;
use crate::error::{QueueError, Result};
use crate::job::{JobName, JobRequest};
use crate::metrics;
use crate::queue::Queue;
use crate::registry::JobHandler;
use crate::schedule::Schedule;

/// Metadata key holding the persisted instant of the last scheduler tick.
///
/// Keys beginning with `jobSchedule` are reserved for the scheduler.
pub const SCHEDULE_CURSOR_KEY: &str = "jobScheduleLastDate";

/// Replay policy for firings missed while the scheduler was down.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScheduleAccuracy {
    /// Collapse missed firings into a single push per entry.
    #[default]
    Latest,
    /// Replay every missed firing, in order.
    All,
}

/// One recurring job registration.
#[derive(Clone, Debug)]
pub struct ScheduleEntry {
    name: JobName,
    parameters: Vec<u8>,
    schedule: Schedule,
    accuracy: ScheduleAccuracy,
    next_fire: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn name(&self) -> &JobName {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn accuracy(&self) -> ScheduleAccuracy {
        self.accuracy
    }

    /// Next instant this entry is due; strictly advances on every fire.
    pub fn next_fire(&self) -> DateTime<Utc> {
        self.next_fire
    }

    fn to_request(&self) -> JobRequest {
        JobRequest::new(self.name.clone(), self.parameters.clone())
    }
}

/// Long-running service that pushes registered entries onto the queue at
/// each scheduled instant.
///
/// The only persistent state is the [`SCHEDULE_CURSOR_KEY`] timestamp in
/// the driver's metadata store; next-fire times are rebuilt from it on
/// startup, so missed windows replay according to each entry's accuracy
/// and the scheduler survives restarts without further bookkeeping.
pub struct JobScheduler<D: QueueDriver> {
    queue: Queue<D>,
    entries: Vec<ScheduleEntry>,
}

impl<D: QueueDriver> JobScheduler<D> {
    pub fn new(queue: Queue<D>) -> Self {
        Self {
            queue,
            entries: Vec::new(),
        }
    }

    /// Register a recurring job with the default (`Latest`) accuracy.
    pub fn add_job<H: JobHandler>(&mut self, payload: &H::Payload, schedule: Schedule) -> Result<()> {
        self.add_job_with::<H>(payload, schedule, ScheduleAccuracy::default())
    }

    /// Register a recurring job with an explicit replay accuracy.
    pub fn add_job_with<H: JobHandler>(
        &mut self,
        payload: &H::Payload,
        schedule: Schedule,
        accuracy: ScheduleAccuracy,
    ) -> Result<()> {
        let parameters = serde_json::to_vec(payload).map_err(QueueError::EncodeFailed)?;
        self.entries.push(ScheduleEntry {
            name: JobName::new(H::NAME),
            parameters,
            schedule,
            accuracy,
            next_fire: schedule.next_after(Utc::now()),
        });
        Ok(())
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Entry with the smallest next-fire time; ties break to the lower
    /// index.
    pub fn next_entry(&self) -> Option<(usize, &ScheduleEntry)> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.next_fire)
    }

    /// Run until shut down.
    ///
    /// Reads the cursor, replays the missed window, then sleeps until each
    /// next fire instant. The sleep is interrupted by the shutdown watch;
    /// a closed channel counts as shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.entries.is_empty() {
            info!("scheduler has no entries, exiting");
            return Ok(());
        }
        let driver = Arc::clone(self.queue.driver());

        let last_date = self.read_cursor(&driver).await.unwrap_or_else(Utc::now);
        self.seed_from(last_date);
        info!(entries = self.entries.len(), %last_date, "scheduler starting");

        self.catch_up(&driver).await;

        loop {
            let Some((_, entry)) = self.next_entry() else {
                break;
            };
            let fire = entry.next_fire();
            let wait = (fire - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.fire_due(fire).await;
            self.write_cursor(&driver, fire).await;
        }
        Ok(())
    }

    /// Rebuild every entry's next-fire time from a cursor instant.
    fn seed_from(&mut self, last_date: DateTime<Utc>) {
        for entry in &mut self.entries {
            entry.next_fire = entry.schedule.next_after(last_date);
        }
    }

    /// Replay the window between the cursor and now.
    ///
    /// `Latest` entries collapse the whole window into one push and jump
    /// past now; `All` entries replay each missed instant in
    /// non-decreasing order. Afterwards everything at or before now has
    /// been handled, so the cursor advances to now.
    async fn catch_up(&mut self, driver: &Arc<D>) {
        let now = Utc::now();
        let mut replayed = 0usize;

        for idx in 0..self.entries.len() {
            let entry = &self.entries[idx];
            if entry.accuracy != ScheduleAccuracy::Latest || entry.next_fire > now {
                continue;
            }
            self.push_entry(idx).await;
            let entry = &mut self.entries[idx];
            entry.next_fire = entry.schedule.next_after(now);
            replayed += 1;
        }

        loop {
            let due = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| {
                    entry.accuracy == ScheduleAccuracy::All && entry.next_fire <= now
                })
                .min_by_key(|(_, entry)| entry.next_fire)
                .map(|(idx, _)| idx);
            let Some(idx) = due else { break };

            self.push_entry(idx).await;
            let entry = &mut self.entries[idx];
            entry.next_fire = entry.schedule.next_after(entry.next_fire);
            replayed += 1;
        }

        if replayed > 0 {
            info!(replayed, "replayed missed schedule firings");
        }
        self.write_cursor(driver, now).await;
    }

    /// Push every entry due at `fire` and advance it past that instant.
    async fn fire_due(&mut self, fire: DateTime<Utc>) {
        let due: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.next_fire <= fire)
            .map(|(idx, _)| idx)
            .collect();

        for idx in due {
            self.push_entry(idx).await;
            let entry = &mut self.entries[idx];
            entry.next_fire = entry.schedule.next_after(fire);
        }
    }

    async fn push_entry(&self, idx: usize) {
        let entry = &self.entries[idx];
        debug!(name = %entry.name, fire = %entry.next_fire, "firing scheduled job");
        if let Err(err) = self.queue.push_request(entry.to_request()).await {
            warn!(name = %entry.name, error = %err, "failed to push scheduled job");
        }
    }

    async fn read_cursor(&self, driver: &Arc<D>) -> Option<DateTime<Utc>> {
        let bytes = match driver.get_metadata(SCHEDULE_CURSOR_KEY).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                debug!(error = %err, "failed to read schedule cursor");
                metrics::driver_error("get_metadata");
                return None;
            }
        };
        let text = String::from_utf8(bytes).ok()?;
        match DateTime::parse_from_rfc3339(&text) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(err) => {
                warn!(error = %err, "ignoring unparseable schedule cursor");
                None
            }
        }
    }

    async fn write_cursor(&self, driver: &Arc<D>, at: DateTime<Utc>) {
        if let Err(err) = driver
            .set_metadata(SCHEDULE_CURSOR_KEY, at.to_rfc3339().as_bytes())
            .await
        {
            debug!(error = %err, "failed to persist schedule cursor");
            metrics::driver_error("set_metadata");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration, Timelike};

    use super::*;
    use crate::error::JobError;
    use crate::job::JobContext;
    use crate::test_support::ScriptedDriver;

    struct Tick;

    #[async_trait]
    impl JobHandler for Tick {
        const NAME: &'static str = "tick";
        type Payload = u32;

        async fn execute(
            &self,
            _payload: u32,
            _ctx: JobContext,
        ) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    struct Tock;

    #[async_trait]
    impl JobHandler for Tock {
        const NAME: &'static str = "tock";
        type Payload = u32;

        async fn execute(
            &self,
            _payload: u32,
            _ctx: JobContext,
        ) -> std::result::Result<(), JobError> {
            Ok(())
        }
    }

    fn scheduler_with(
        driver: &Arc<ScriptedDriver>,
        jobs: &[(Schedule, ScheduleAccuracy)],
    ) -> JobScheduler<ScriptedDriver> {
        let mut scheduler = JobScheduler::new(Queue::new(Arc::clone(driver)));
        for (schedule, accuracy) in jobs {
            scheduler
                .add_job_with::<Tick>(&0, *schedule, *accuracy)
                .expect("add job");
        }
        scheduler
    }

    /// A rule whose most recent firing was five seconds ago.
    fn recently_fired_rule() -> Schedule {
        Schedule::every_minute((Utc::now() - Duration::seconds(5)).second())
    }

    #[tokio::test]
    async fn next_entry_prefers_the_earliest_fire_time() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut scheduler = JobScheduler::new(Queue::new(Arc::clone(&driver)));
        let now = Utc::now();

        let soon = (now + Duration::seconds(10)).second();
        let later = (now + Duration::seconds(40)).second();
        scheduler
            .add_job_with::<Tick>(&0, Schedule::every_minute(later), ScheduleAccuracy::Latest)
            .expect("add");
        scheduler
            .add_job_with::<Tock>(&0, Schedule::every_minute(soon), ScheduleAccuracy::Latest)
            .expect("add");
        scheduler.seed_from(now);

        let (idx, entry) = scheduler.next_entry().expect("entries exist");
        assert_eq!(idx, 1);
        assert_eq!(entry.name().as_str(), "tock");
    }

    #[tokio::test]
    async fn next_entry_breaks_ties_towards_the_lower_index() {
        let driver = Arc::new(ScriptedDriver::default());
        let rule = Schedule::every_minute(30);
        let mut scheduler = scheduler_with(
            &driver,
            &[
                (rule, ScheduleAccuracy::Latest),
                (rule, ScheduleAccuracy::Latest),
            ],
        );
        scheduler.seed_from(Utc::now());

        let (idx, _) = scheduler.next_entry().expect("entries exist");
        assert_eq!(idx, 0);
    }

    #[tokio::test]
    async fn catch_up_all_replays_every_missed_firing() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut scheduler =
            scheduler_with(&driver, &[(recently_fired_rule(), ScheduleAccuracy::All)]);

        // Two whole firings fall inside the missed window.
        scheduler.seed_from(Utc::now() - Duration::seconds(125));
        scheduler.catch_up(&driver).await;

        assert_eq!(driver.pushed.lock().expect("pushed").len(), 2);
        assert!(
            scheduler.entries()[0].next_fire() > Utc::now() - Duration::seconds(1),
            "entry must be fast-forwarded past the missed window"
        );
    }

    #[tokio::test]
    async fn catch_up_latest_collapses_the_missed_window() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut scheduler =
            scheduler_with(&driver, &[(recently_fired_rule(), ScheduleAccuracy::Latest)]);

        scheduler.seed_from(Utc::now() - Duration::seconds(125));
        scheduler.catch_up(&driver).await;

        assert_eq!(driver.pushed.lock().expect("pushed").len(), 1);
        assert!(scheduler.entries()[0].next_fire() > Utc::now());
    }

    #[tokio::test]
    async fn catch_up_with_nothing_due_pushes_nothing() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut scheduler =
            scheduler_with(&driver, &[(recently_fired_rule(), ScheduleAccuracy::All)]);

        scheduler.seed_from(Utc::now());
        scheduler.catch_up(&driver).await;

        assert!(driver.pushed.lock().expect("pushed").is_empty());
    }

    #[tokio::test]
    async fn catch_up_advances_the_cursor() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut scheduler =
            scheduler_with(&driver, &[(recently_fired_rule(), ScheduleAccuracy::All)]);

        scheduler.seed_from(Utc::now() - Duration::seconds(125));
        scheduler.catch_up(&driver).await;

        let metadata = driver.metadata.lock().expect("metadata");
        let cursor = metadata
            .get(SCHEDULE_CURSOR_KEY)
            .expect("cursor must be written");
        let parsed = DateTime::parse_from_rfc3339(
            std::str::from_utf8(cursor).expect("cursor is utf8"),
        )
        .expect("cursor parses");
        assert!(Utc::now() - parsed.with_timezone(&Utc) < Duration::seconds(5));
    }

    #[tokio::test]
    async fn replay_order_is_non_decreasing_across_entries() {
        let driver = Arc::new(ScriptedDriver::default());
        let mut scheduler = JobScheduler::new(Queue::new(Arc::clone(&driver)));
        let now = Utc::now();

        // Offset the two rules so their missed firings interleave.
        let a = (now - Duration::seconds(5)).second();
        let b = (now - Duration::seconds(20)).second();
        scheduler
            .add_job_with::<Tick>(&0, Schedule::every_minute(a), ScheduleAccuracy::All)
            .expect("add");
        scheduler
            .add_job_with::<Tock>(&0, Schedule::every_minute(b), ScheduleAccuracy::All)
            .expect("add");

        scheduler.seed_from(now - Duration::seconds(125));
        scheduler.catch_up(&driver).await;

        let pushed = driver.pushed.lock().expect("pushed");
        assert_eq!(pushed.len(), 4);
        // tick and tock alternate when replayed in firing order.
        let names: Vec<&str> = pushed.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["tock", "tick", "tock", "tick"]);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_fire_wait() {
        let driver = Arc::new(ScriptedDriver::default());
        let scheduler =
            scheduler_with(&driver, &[(Schedule::daily(0, 0, chrono_tz::Tz::UTC), ScheduleAccuracy::Latest)]);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).expect("signal shutdown");

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("scheduler must stop promptly")
            .expect("join")
            .expect("run result");
    }
}
