//! Recurring job submission.
//!
//! Wakes every `tick`, submits each entry whose next run has passed through
//! [`JobService::submit_job`], then moves that entry to its following slot.
//! Slots missed while the process was down or the loop was busy collapse
//! into one submission. Times are UTC.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use fleetroute_core::{Job, JobType};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::clock::Clock;
use crate::service::JobService;

const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// When a scheduled entry comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Every day, `at` past midnight.
    Daily { at: ChronoDuration },
    /// Once a week on `weekday`, `at` past midnight.
    Weekly { weekday: Weekday, at: ChronoDuration },
}

impl Cadence {
    pub fn daily(hour: i64, minute: i64) -> Self {
        Cadence::Daily {
            at: ChronoDuration::hours(hour) + ChronoDuration::minutes(minute),
        }
    }

    pub fn weekly(weekday: Weekday, hour: i64, minute: i64) -> Self {
        Cadence::Weekly {
            weekday,
            at: ChronoDuration::hours(hour) + ChronoDuration::minutes(minute),
        }
    }

    /// First slot strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::default()));
        match *self {
            Cadence::Daily { at } => {
                let slot = midnight + at;
                if slot > now { slot } else { slot + ChronoDuration::days(1) }
            }
            Cadence::Weekly { weekday, at } => {
                let ahead = (7 + weekday.num_days_from_monday() - now.weekday().num_days_from_monday()) % 7;
                let slot = midnight + ChronoDuration::days(i64::from(ahead)) + at;
                if slot > now { slot } else { slot + ChronoDuration::weeks(1) }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job_type: JobType,
    pub cadence: Cadence,
    pub payload: Value,
}

/// Model upkeep: drift monitoring daily at 02:00, retraining check Mondays at 03:00.
pub fn ml_maintenance() -> Vec<ScheduledJob> {
    vec![
        ScheduledJob {
            job_type: JobType::MlMonitor,
            cadence: Cadence::daily(2, 0),
            payload: json!({ "trigger": "daily" }),
        },
        ScheduledJob {
            job_type: JobType::MlRetrainIfNeeded,
            cadence: Cadence::weekly(Weekday::Mon, 3, 0),
            payload: json!({ "trigger": "weekly" }),
        },
    ]
}

/// Handle to stop and join a spawned scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler task panicked");
        }
    }
}

pub struct JobScheduler {
    service: Arc<JobService>,
    clock: Arc<dyn Clock>,
    entries: Vec<ScheduledJob>,
    tick: Duration,
}

impl JobScheduler {
    pub fn new(service: Arc<JobService>, clock: Arc<dyn Clock>, entries: Vec<ScheduledJob>) -> Self {
        Self {
            service,
            clock,
            entries,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(rx).await });
        SchedulerHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut due = self.first_slots();
        for (entry, next) in self.entries.iter().zip(&due) {
            info!(job_type = %entry.job_type, next_run = %next, "job scheduled");
        }

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.submit_due(&mut due).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("scheduler stopped");
    }

    fn first_slots(&self) -> Vec<DateTime<Utc>> {
        let now = self.clock.now();
        self.entries.iter().map(|e| e.cadence.next_after(now)).collect()
    }

    /// Submits every entry at or past its slot and advances it. A failed
    /// submission waits for the next slot.
    async fn submit_due(&self, due: &mut [DateTime<Utc>]) -> Vec<Job> {
        let now = self.clock.now();
        let mut submitted = Vec::new();
        for (entry, next) in self.entries.iter().zip(due.iter_mut()) {
            if now < *next {
                continue;
            }
            match self.service.submit_job(entry.job_type, entry.payload.clone()).await {
                Ok(job) => {
                    info!(event = "scheduler.submitted", job_id = %job.id, job_type = %entry.job_type);
                    submitted.push(job);
                }
                Err(e) => {
                    error!(event = "scheduler.submit_failed", job_type = %entry.job_type, error = %e);
                }
            }
            *next = entry.cadence.next_after(now);
        }
        submitted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DispatchMode;
    use crate::dispatch::{EnqueueError, QueueDispatcher, TaskMessage};
    use crate::engine::Engine;
    use crate::executors::{Executor, ExecutorFailure, ExecutorRegistry, StepContext};
    use crate::EngineConfig;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        let naive = NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap();
        Utc.from_utc_datetime(&naive)
    }

    #[test]
    fn daily_slot_is_today_until_it_passes() {
        let cadence = Cadence::daily(2, 0);
        // 2026-10-19 is a Monday.
        assert_eq!(cadence.next_after(at(2026, 10, 19, 1, 59)), at(2026, 10, 19, 2, 0));
        assert_eq!(cadence.next_after(at(2026, 10, 19, 2, 0)), at(2026, 10, 20, 2, 0));
        assert_eq!(cadence.next_after(at(2026, 10, 31, 23, 0)), at(2026, 11, 1, 2, 0));
    }

    #[test]
    fn weekly_slot_lands_on_the_weekday() {
        let cadence = Cadence::weekly(Weekday::Mon, 3, 0);
        assert_eq!(cadence.next_after(at(2026, 10, 19, 2, 0)), at(2026, 10, 19, 3, 0));
        assert_eq!(cadence.next_after(at(2026, 10, 19, 3, 0)), at(2026, 10, 26, 3, 0));
        assert_eq!(cadence.next_after(at(2026, 10, 22, 12, 0)), at(2026, 10, 26, 3, 0));
        assert_eq!(cadence.next_after(at(2026, 10, 25, 23, 59)), at(2026, 10, 26, 3, 0));
    }

    struct Noop;

    #[async_trait]
    impl Executor for Noop {
        async fn execute(&self, _ctx: &StepContext) -> Result<Value, ExecutorFailure> {
            Ok(json!({}))
        }
    }

    #[derive(Default)]
    struct CollectingQueue {
        sent: Mutex<Vec<TaskMessage>>,
    }

    #[async_trait]
    impl QueueDispatcher for CollectingQueue {
        fn mode(&self) -> DispatchMode {
            DispatchMode::Push
        }

        async fn enqueue(&self, message: TaskMessage) -> Result<(), EnqueueError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    async fn scheduler_at(start: DateTime<Utc>) -> (JobScheduler, Arc<ManualClock>, Arc<CollectingQueue>) {
        let clock = Arc::new(ManualClock::new(start));
        let queue = Arc::new(CollectingQueue::default());
        let registry = ExecutorRegistry::new()
            .with_single(JobType::MlMonitor, Arc::new(Noop))
            .with_single(JobType::MlRetrainIfNeeded, Arc::new(Noop));
        let engine = Engine::builder(EngineConfig::default())
            .with_clock(clock.clone())
            .with_dispatcher(queue.clone())
            .with_registry(registry)
            .build()
            .await
            .unwrap();
        let scheduler = JobScheduler::new(engine.service.clone(), clock.clone(), ml_maintenance());
        (scheduler, clock, queue)
    }

    #[tokio::test]
    async fn submits_each_entry_once_per_slot() {
        // Sunday evening: both entries come due overnight.
        let (scheduler, clock, queue) = scheduler_at(at(2026, 10, 18, 22, 0)).await;
        let mut due = scheduler.first_slots();
        assert_eq!(due, vec![at(2026, 10, 19, 2, 0), at(2026, 10, 19, 3, 0)]);

        assert!(scheduler.submit_due(&mut due).await.is_empty());

        clock.set(at(2026, 10, 19, 2, 1));
        let jobs = scheduler.submit_due(&mut due).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::MlMonitor);
        assert_eq!(jobs[0].payload, json!({ "trigger": "daily" }));

        // Same hour again: nothing new.
        assert!(scheduler.submit_due(&mut due).await.is_empty());

        clock.set(at(2026, 10, 19, 3, 0));
        let jobs = scheduler.submit_due(&mut due).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::MlRetrainIfNeeded);

        assert_eq!(due, vec![at(2026, 10, 20, 2, 0), at(2026, 10, 26, 3, 0)]);
        assert_eq!(queue.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missed_slots_collapse_into_one_submission() {
        let (scheduler, clock, _queue) = scheduler_at(at(2026, 10, 19, 4, 0)).await;
        let mut due = scheduler.first_slots();

        // Asleep for three days.
        clock.set(at(2026, 10, 22, 12, 0));
        let jobs = scheduler.submit_due(&mut due).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::MlMonitor);
        assert_eq!(due[0], at(2026, 10, 23, 2, 0));
    }

    #[tokio::test]
    async fn spawned_scheduler_stops_on_shutdown() {
        let (scheduler, _clock, queue) = scheduler_at(at(2026, 10, 19, 1, 0)).await;
        let handle = scheduler.with_tick(Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;
        assert!(queue.sent.lock().unwrap().is_empty());
    }
}
