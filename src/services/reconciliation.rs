//! Nightly reconciliation jobs
//!
//! Both jobs walk their candidates in id order, one chunk at a time, and write
//! each record with a conditional update. A record that fails is logged and left
//! for the next run; it never aborts the batch. A run stopped by its batch limit
//! or its timeout resumes after the last record it processed.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};

use crate::{
    config::SchedulerConfig,
    error::AppResult,
    models::{
        job::{JobKind, JobReport, RunOutcome},
        loan::{Loan, ReminderTarget},
    },
    repository::{DueWindow, LedgerStore},
    services::{notifier::Notifier, policy::PenaltyPolicy, scheduler::local_to_utc},
};

/// A unit of scheduled work.
///
/// `run` accumulates into `report` as it goes so a run cut short by its time
/// budget still reports what it did.
#[async_trait]
pub trait ReconciliationJob: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn run(&self, now: DateTime<Utc>, report: &mut JobReport) -> AppResult<RunOutcome>;
}

/// Last record id a job got to, kept across runs of the same job instance
#[derive(Debug, Default)]
struct ResumePoint(AtomicI64);

impl ResumePoint {
    fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    fn advance(&self, id: i64) {
        self.0.store(id, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Chunking of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub batch_size: i64,
    pub max_batches: u32,
}

impl From<&SchedulerConfig> for BatchLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_batches: config.max_batches_per_run.max(1),
        }
    }
}

/// Recomputes the displayed fee of active overdue loans. Never touches bans.
pub struct OverdueFeeJob {
    store: Arc<dyn LedgerStore>,
    policy: PenaltyPolicy,
    limits: BatchLimits,
    resume: ResumePoint,
}

impl OverdueFeeJob {
    pub fn new(store: Arc<dyn LedgerStore>, policy: PenaltyPolicy, limits: BatchLimits) -> Self {
        Self {
            store,
            policy,
            limits,
            resume: ResumePoint::default(),
        }
    }
}

impl OverdueFeeJob {
    async fn reconcile(&self, loan: &Loan, now: DateTime<Utc>, report: &mut JobReport) {
        let days_late = self.policy.days_late(loan.due_date, now);
        let fee_amount = self.policy.fee(days_late);
        if loan.days_late == days_late && loan.fee_amount == fee_amount {
            return;
        }

        match self.store.record_overdue_fee(loan.id, days_late, fee_amount).await {
            Ok(true) => report.updated += 1,
            Ok(false) => tracing::debug!(loan_id = loan.id, "Loan returned during fee run"),
            Err(e) => {
                report.failed += 1;
                tracing::warn!(loan_id = loan.id, error = %e, "Failed to record overdue fee");
            }
        }
    }
}

#[async_trait]
impl ReconciliationJob for OverdueFeeJob {
    fn kind(&self) -> JobKind {
        JobKind::OverdueFees
    }

    async fn run(&self, now: DateTime<Utc>, report: &mut JobReport) -> AppResult<RunOutcome> {
        let mut after_id = self.resume.get();

        for _ in 0..self.limits.max_batches {
            let batch = self.store.overdue_loans(now, after_id, self.limits.batch_size).await?;
            let Some(last) = batch.last() else {
                self.resume.reset();
                return Ok(RunOutcome::Drained);
            };
            after_id = last.id;
            let exhausted = (batch.len() as i64) < self.limits.batch_size;

            for loan in &batch {
                report.processed += 1;
                self.reconcile(loan, now, report).await;
                self.resume.advance(loan.id);
            }

            if exhausted {
                self.resume.reset();
                return Ok(RunOutcome::Drained);
            }
        }

        tracing::warn!(
            max_batches = self.limits.max_batches,
            after_id,
            "Overdue fee run hit its batch limit; resuming on the next poll"
        );
        Ok(RunOutcome::MoreRemaining)
    }
}

/// Half-open window covering the calendar day after `now` in the reference timezone
pub fn following_day(now: DateTime<Utc>, offset: FixedOffset) -> DueWindow {
    let tomorrow = now.with_timezone(&offset).date_naive() + Duration::days(1);
    let start = local_to_utc(tomorrow.and_time(NaiveTime::MIN), offset);
    DueWindow {
        start,
        end: start + Duration::days(1),
    }
}

/// Emails borrowers whose loans fall due tomorrow, at most once per loan
pub struct ReminderJob {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    offset: FixedOffset,
    limits: BatchLimits,
    resume: ResumePoint,
}

impl ReminderJob {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        offset: FixedOffset,
        limits: BatchLimits,
    ) -> Self {
        Self {
            store,
            notifier,
            offset,
            limits,
            resume: ResumePoint::default(),
        }
    }

    async fn remind(&self, target: &ReminderTarget, report: &mut JobReport) {
        if target.email.trim().is_empty() {
            tracing::debug!(loan_id = target.loan_id, user = %target.username, "No email address; reminder skipped");
            return;
        }

        // Claim first: a crash after this point loses a reminder, never duplicates one
        match self.store.claim_reminder(target.loan_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(loan_id = target.loan_id, error = %e, "Failed to claim reminder");
                return;
            }
        }

        let title = target.title.as_deref().unwrap_or("your borrowed book");
        match self
            .notifier
            .send_reminder(&target.email, &target.username, title, target.due_date)
            .await
        {
            Ok(()) => {
                report.updated += 1;
                tracing::info!(loan_id = target.loan_id, recipient = %target.email, "Reminder sent");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(loan_id = target.loan_id, error = %e, "Failed to send reminder");
                if let Err(e) = self.store.release_reminder(target.loan_id).await {
                    tracing::error!(
                        loan_id = target.loan_id,
                        error = %e,
                        "Reminder claim could not be released; loan will not be reminded"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ReconciliationJob for ReminderJob {
    fn kind(&self) -> JobKind {
        JobKind::DueReminders
    }

    async fn run(&self, now: DateTime<Utc>, report: &mut JobReport) -> AppResult<RunOutcome> {
        let window = following_day(now, self.offset);
        let mut after_id = self.resume.get();

        for _ in 0..self.limits.max_batches {
            let batch = self
                .store
                .reminder_candidates(window, after_id, self.limits.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                self.resume.reset();
                return Ok(RunOutcome::Drained);
            };
            after_id = last.loan_id;
            let exhausted = (batch.len() as i64) < self.limits.batch_size;

            for target in &batch {
                report.processed += 1;
                self.remind(target, report).await;
                self.resume.advance(target.loan_id);
            }

            if exhausted {
                self.resume.reset();
                return Ok(RunOutcome::Drained);
            }
        }

        tracing::warn!(
            max_batches = self.limits.max_batches,
            after_id,
            "Reminder run hit its batch limit; resuming on the next poll"
        );
        Ok(RunOutcome::MoreRemaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AppError,
        models::{
            item::Item,
            loan::{Loan, NewLoan},
            user::{Borrower, Role},
        },
        repository::MemoryStore,
        services::notifier::MockNotifier,
    };
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn istanbul() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn limits() -> BatchLimits {
        BatchLimits {
            batch_size: 2,
            max_batches: 10,
        }
    }

    fn loan(id: i64, user_id: i64, due_date: DateTime<Utc>) -> Loan {
        Loan::open(
            id,
            &NewLoan {
                user_id,
                item_id: id,
                loan_date: due_date - Duration::days(14),
                due_date,
                max_active_loans: 1,
            },
        )
    }

    async fn store_with_borrowers() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (id, email) in [(1, "a@example.org"), (2, "")] {
            store
                .add_borrower(Borrower {
                    id,
                    username: format!("user{}", id),
                    email: email.to_string(),
                    role: Role::Member,
                    ban_until: None,
                    is_permanent_ban: false,
                })
                .await;
        }
        store
    }

    #[test]
    fn test_following_day_uses_reference_timezone() {
        // 22:30 UTC is already the next day in UTC+3
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 22, 30, 0).unwrap();
        let window = following_day(now, istanbul());

        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 6, 2, 21, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 6, 3, 21, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_overdue_fee_job_updates_active_loans_only() {
        let store = store_with_borrowers().await;
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 0, 1, 0).unwrap();
        for id in 1..=5 {
            store.insert_loan(loan(id, 1, now - Duration::days(id))).await;
        }
        let mut returned = loan(6, 1, now - Duration::days(3));
        returned.is_returned = true;
        returned.return_date = Some(now - Duration::days(5));
        store.insert_loan(returned).await;

        let job = OverdueFeeJob::new(store.clone(), PenaltyPolicy::new(Decimal::from(5), 2, "TRY"), limits());
        let mut report = JobReport::default();
        job.run(now, &mut report).await.unwrap();

        assert_eq!(report, JobReport { processed: 5, updated: 5, failed: 0 });
        let fourth = store.loan(4).await.unwrap();
        assert_eq!(fourth.days_late, 4);
        assert_eq!(fourth.fee_amount, Decimal::from(20));
        assert_eq!(store.loan(6).await.unwrap().fee_amount, Decimal::ZERO);

        // Second run over unchanged data writes nothing
        let mut again = JobReport::default();
        job.run(now, &mut again).await.unwrap();
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn test_reminder_job_sends_once_and_skips_missing_email() {
        let store = store_with_borrowers().await;
        store.add_item(Item { id: 1, title: "Dune".to_string(), available: false }).await;
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let tomorrow = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        store.insert_loan(loan(1, 1, tomorrow)).await;
        store.insert_loan(loan(2, 2, tomorrow)).await;
        store.insert_loan(loan(3, 1, tomorrow + Duration::days(3))).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_reminder()
            .withf(|to, user, title, _| to.contains("a@example.org") && user.contains("user1") && title.contains("Dune"))
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let job = ReminderJob::new(store.clone(), Arc::new(notifier), istanbul(), limits());
        let mut report = JobReport::default();
        job.run(now, &mut report).await.unwrap();
        let mut again = JobReport::default();
        job.run(now, &mut again).await.unwrap();

        assert_eq!(report.updated, 1);
        assert!(store.loan(1).await.unwrap().reminder_sent);
        assert!(!store.loan(2).await.unwrap().reminder_sent);
        assert!(!store.loan(3).await.unwrap().reminder_sent);
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn test_failed_reminder_is_retried_next_run() {
        let store = store_with_borrowers().await;
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        store
            .insert_loan(loan(1, 1, Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap()))
            .await;

        let mut failing = MockNotifier::new();
        failing
            .expect_send_reminder()
            .times(1)
            .returning(|_, _, _, _| Err(AppError::Notification("smtp down".to_string())));
        let job = ReminderJob::new(store.clone(), Arc::new(failing), istanbul(), limits());
        let mut report = JobReport::default();
        job.run(now, &mut report).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(!store.loan(1).await.unwrap().reminder_sent);

        let mut working = MockNotifier::new();
        working
            .expect_send_reminder()
            .withf(|_, _, title, _| title.contains("your borrowed book"))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let job = ReminderJob::new(store.clone(), Arc::new(working), istanbul(), limits());
        job.run(now, &mut JobReport::default()).await.unwrap();

        assert!(store.loan(1).await.unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_the_batch() {
        let store = store_with_borrowers().await;
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let tomorrow = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        for id in 1..=3 {
            store.insert_loan(loan(id, 1, tomorrow)).await;
        }

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut notifier = MockNotifier::new();
        notifier.expect_send_reminder().times(3).returning({
            let calls = calls.clone();
            move |_, _, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::Notification("mailbox full".to_string()))
                } else {
                    Ok(())
                }
            }
        });

        let job = ReminderJob::new(store.clone(), Arc::new(notifier), istanbul(), limits());
        let mut report = JobReport::default();
        let outcome = job.run(now, &mut report).await.unwrap();

        assert_eq!(outcome, RunOutcome::Drained);
        assert_eq!(report, JobReport { processed: 3, updated: 2, failed: 1 });
        assert!(!store.loan(1).await.unwrap().reminder_sent);
        assert!(store.loan(2).await.unwrap().reminder_sent);
        assert!(store.loan(3).await.unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn test_reminders_past_the_batch_limit_go_out_when_the_slot_resumes() {
        use crate::{
            models::job::JobRunStatus,
            services::{
                clock::ManualClock,
                scheduler::{DailySchedule, ScheduledTask},
            },
        };

        let store = store_with_borrowers().await;
        let tomorrow = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        for id in 1..=3 {
            store.insert_loan(loan(id, 1, tomorrow)).await;
        }

        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_reminder()
            .times(3)
            .returning(|_, _, _, _| Ok(()));
        let job = ReminderJob::new(
            store.clone(),
            Arc::new(notifier),
            istanbul(),
            BatchLimits {
                batch_size: 1,
                max_batches: 1,
            },
        );
        // 09:00 in the library's timezone
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap());
        let task = ScheduledTask::new(
            Arc::new(job),
            DailySchedule::new(NaiveTime::from_hms_opt(9, 0, 0).unwrap(), istanbul()),
            store.clone(),
            Arc::new(clock.clone()),
            std::time::Duration::from_secs(60),
        );

        let first = task.run_if_due().await.unwrap().unwrap();
        assert_eq!(first.status, JobRunStatus::Incomplete);
        assert!(store.loan(1).await.unwrap().reminder_sent);
        assert!(!store.loan(2).await.unwrap().reminder_sent);

        let mut statuses = Vec::new();
        while let Some(run) = task.run_if_due().await.unwrap() {
            clock.advance(Duration::minutes(1));
            statuses.push(run.status);
        }

        assert_eq!(
            statuses,
            vec![JobRunStatus::Incomplete, JobRunStatus::Incomplete, JobRunStatus::Succeeded]
        );
        for id in 1..=3 {
            assert!(store.loan(id).await.unwrap().reminder_sent);
        }
    }
}
