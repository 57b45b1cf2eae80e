//! Daily scheduling of the reconciliation jobs

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tokio::{
    sync::{watch, Mutex},
    time::MissedTickBehavior,
};

use crate::{
    error::AppResult,
    models::job::{JobKind, JobReport, JobRun, JobRunStatus, RunOutcome},
    repository::LedgerStore,
    services::{clock::Clock, reconciliation::ReconciliationJob},
};

/// Interpret a wall-clock time in `offset` as an instant
pub fn local_to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
}

/// A time of day in a fixed reference offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    pub at: NaiveTime,
    pub offset: FixedOffset,
}

impl DailySchedule {
    pub fn new(at: NaiveTime, offset: FixedOffset) -> Self {
        Self { at, offset }
    }

    /// The most recent trigger instant at or before `now`
    pub fn latest_slot(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.offset).date_naive();
        let slot = local_to_utc(today.and_time(self.at), self.offset);
        if slot <= now {
            slot
        } else {
            slot - Duration::days(1)
        }
    }
}

/// One job bound to its schedule. Clones share the overlap guard.
#[derive(Clone)]
pub struct ScheduledTask {
    job: Arc<dyn ReconciliationJob>,
    schedule: DailySchedule,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    timeout: StdDuration,
    running: Arc<Mutex<()>>,
}

impl ScheduledTask {
    pub fn new(
        job: Arc<dyn ReconciliationJob>,
        schedule: DailySchedule,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        timeout: StdDuration,
    ) -> Self {
        Self {
            job,
            schedule,
            store,
            clock,
            timeout,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind()
    }

    /// Run the job if its latest slot has no completed run yet. A slot whose
    /// run stopped early stays open, so the next poll picks it up again.
    ///
    /// Returns the recorded run, or `None` when nothing was due or the previous
    /// run of this job is still in progress.
    pub async fn run_if_due(&self) -> AppResult<Option<JobRun>> {
        let kind = self.kind();

        let Ok(_guard) = self.running.clone().try_lock_owned() else {
            tracing::warn!(job = %kind, "Previous run still in progress; skipping");
            return Ok(None);
        };

        let now = self.clock.now();
        let slot = self.schedule.latest_slot(now);
        if let Some(last) = self.store.last_completed_slot(kind).await? {
            if last >= slot {
                return Ok(None);
            }
        }

        let mut run = JobRun::begin(kind, slot, now);
        self.store.begin_job_run(&run).await?;
        tracing::info!(job = %kind, run_id = %run.id, slot = %slot, "Starting reconciliation job");

        let mut report = JobReport::default();
        let status = match tokio::time::timeout(self.timeout, self.job.run(now, &mut report)).await {
            Ok(Ok(RunOutcome::Drained)) => JobRunStatus::Succeeded,
            Ok(Ok(RunOutcome::MoreRemaining)) => JobRunStatus::Incomplete,
            Ok(Err(e)) => {
                tracing::error!(job = %kind, run_id = %run.id, error = %e, "Reconciliation job failed");
                JobRunStatus::Failed
            }
            Err(_) => {
                tracing::warn!(
                    job = %kind,
                    run_id = %run.id,
                    timeout_secs = self.timeout.as_secs(),
                    "Reconciliation job timed out"
                );
                JobRunStatus::TimedOut
            }
        };

        run.finish(status, report, self.clock.now());
        self.store.finish_job_run(&run).await?;

        tracing::info!(
            job = %kind,
            run_id = %run.id,
            status = status.as_str(),
            processed = report.processed,
            updated = report.updated,
            failed = report.failed,
            "Reconciliation job finished"
        );

        Ok(Some(run))
    }
}

/// Polls every task and starts the due ones on their own tokio task
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    poll_interval: StdDuration,
}

impl Scheduler {
    pub fn new(tasks: Vec<ScheduledTask>, poll_interval: StdDuration) -> Self {
        Self { tasks, poll_interval }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            tasks = self.tasks.len(),
            poll_secs = self.poll_interval.as_secs(),
            "Starting reconciliation scheduler"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for task in &self.tasks {
                        let task = task.clone();
                        tokio::spawn(async move {
                            if let Err(e) = task.run_if_due().await {
                                tracing::error!(job = %task.kind(), error = %e, "Scheduled job check failed");
                            }
                        });
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciliation scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AppError,
        repository::MemoryStore,
        services::clock::ManualClock,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn istanbul() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    /// Job that counts its runs and optionally blocks or fails
    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
        hold: Option<Arc<tokio::sync::Notify>>,
    }

    impl CountingJob {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
                fail: false,
                hold: None,
            }
        }
    }

    #[async_trait]
    impl ReconciliationJob for CountingJob {
        fn kind(&self) -> JobKind {
            JobKind::OverdueFees
        }

        async fn run(&self, _now: DateTime<Utc>, report: &mut JobReport) -> AppResult<RunOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            report.processed += 1;
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if self.fail {
                return Err(AppError::Internal("boom".to_string()));
            }
            Ok(RunOutcome::Drained)
        }
    }

    fn task(job: Arc<CountingJob>, store: Arc<MemoryStore>, clock: ManualClock) -> ScheduledTask {
        ScheduledTask::new(
            job,
            DailySchedule::new(at(0, 1), istanbul()),
            store,
            Arc::new(clock),
            StdDuration::from_secs(60),
        )
    }

    #[test]
    fn test_latest_slot_in_reference_offset() {
        let schedule = DailySchedule::new(at(9, 0), istanbul());

        // 05:59 UTC is 08:59 local: today's slot has not fired yet
        let before = Utc.with_ymd_and_hms(2024, 6, 2, 5, 59, 0).unwrap();
        assert_eq!(schedule.latest_slot(before), Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap());

        let exactly = Utc.with_ymd_and_hms(2024, 6, 2, 6, 0, 0).unwrap();
        assert_eq!(schedule.latest_slot(exactly), exactly);
    }

    #[tokio::test]
    async fn test_runs_once_per_slot_and_catches_up() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let job = Arc::new(CountingJob::new());
        let task = task(job.clone(), store.clone(), clock.clone());

        let first = task.run_if_due().await.unwrap().unwrap();
        assert_eq!(first.status, JobRunStatus::Succeeded);
        assert!(task.run_if_due().await.unwrap().is_none());

        // Two slots missed while "down": one catch-up run
        clock.advance(Duration::days(2));
        assert!(task.run_if_due().await.unwrap().is_some());
        assert!(task.run_if_due().await.unwrap().is_none());

        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.job_runs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let job = Arc::new(CountingJob {
            fail: true,
            ..CountingJob::new()
        });
        let task = task(job.clone(), store.clone(), clock);

        let run = task.run_if_due().await.unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Failed);
        assert_eq!(run.report.processed, 1);
        assert!(task.run_if_due().await.unwrap().is_some());
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_overlapping_check_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let hold = Arc::new(tokio::sync::Notify::new());
        let job = Arc::new(CountingJob {
            hold: Some(hold.clone()),
            ..CountingJob::new()
        });
        let task = task(job.clone(), store, clock);

        let background = {
            let task = task.clone();
            tokio::spawn(async move { task.run_if_due().await })
        };
        while job.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(task.run_if_due().await.unwrap().is_none());

        hold.notify_one();
        let finished = background.await.unwrap().unwrap().unwrap();
        assert_eq!(finished.status, JobRunStatus::Succeeded);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_run_leaves_its_slot_open() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let job = Arc::new(CountingJob {
            hold: Some(Arc::new(tokio::sync::Notify::new())),
            ..CountingJob::new()
        });
        let task = task(job.clone(), store, clock);

        let run = task.run_if_due().await.unwrap().unwrap();

        assert_eq!(run.status, JobRunStatus::TimedOut);
        assert_eq!(run.report.processed, 1);

        let retry = task.run_if_due().await.unwrap().unwrap();
        assert_eq!(retry.slot, run.slot);
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let job = Arc::new(CountingJob::new());
        let scheduler = Scheduler::new(
            vec![task(job, store, clock)],
            StdDuration::from_millis(10),
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
