//! Repository layer for database operations

pub mod items;
pub mod jobs;
pub mod loans;
pub mod memory;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{
        item::Item,
        job::{JobKind, JobRun},
        loan::{Loan, LoanClosure, LoanPurge, NewLoan, OpenLoanOutcome, PurgeReport, ReminderTarget},
        user::Borrower,
    },
};

pub use memory::MemoryStore;

/// Half-open `[start, end)` interval of due dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DueWindow {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Persistence seam for the lending core.
///
/// Every mutating method is a single conditional write (or one transaction) so
/// request handlers and the nightly jobs can interleave without read-modify-write
/// races. A `false`/`None` result means the condition no longer held.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Check connectivity of the backing store
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn find_loan(&self, loan_id: i64) -> AppResult<Option<Loan>>;

    /// All loans of a user, newest first
    async fn loans_for_user(&self, user_id: i64) -> AppResult<Vec<Loan>>;

    async fn find_borrower(&self, user_id: i64) -> AppResult<Option<Borrower>>;

    async fn find_item(&self, item_id: i64) -> AppResult<Option<Item>>;

    async fn count_active_loans(&self, user_id: i64) -> AppResult<i64>;

    /// Sum of fees owed and not yet settled
    async fn outstanding_fees(&self, user_id: i64) -> AppResult<Decimal>;

    /// Flip the item to unavailable (only if available) and insert the loan, atomically
    async fn open_loan(&self, loan: &NewLoan) -> AppResult<OpenLoanOutcome>;

    /// Mark an active loan returned. `None` if it was already returned.
    async fn close_loan(&self, closure: &LoanClosure) -> AppResult<Option<Loan>>;

    /// Compare-and-set of a borrower's ban end
    async fn replace_ban(
        &self,
        user_id: i64,
        expected: Option<DateTime<Utc>>,
        ban_until: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Make an item available again. `false` if the item no longer exists.
    async fn release_item(&self, item_id: i64) -> AppResult<bool>;

    /// Record settlement of a returned loan's unpaid fee. `None` if not applicable.
    async fn settle_fee(
        &self,
        loan_id: i64,
        reference: &str,
        settled_at: DateTime<Utc>,
    ) -> AppResult<Option<Loan>>;

    /// Active loans due before `as_of`, keyset-paginated by id
    async fn overdue_loans(&self, as_of: DateTime<Utc>, after_id: i64, limit: i64) -> AppResult<Vec<Loan>>;

    /// Update the displayed fee of a loan that is still active
    async fn record_overdue_fee(&self, loan_id: i64, days_late: i64, fee_amount: Decimal) -> AppResult<bool>;

    /// Active, not yet reminded loans due inside `window`, keyset-paginated by loan id
    async fn reminder_candidates(
        &self,
        window: DueWindow,
        after_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ReminderTarget>>;

    /// Set `reminder_sent` if it is still unset. `true` means this caller owns the send.
    async fn claim_reminder(&self, loan_id: i64) -> AppResult<bool>;

    /// Undo a claim whose send failed
    async fn release_reminder(&self, loan_id: i64) -> AppResult<()>;

    /// Run the purge's cleanup steps in order, in one transaction
    async fn purge_loans(&self, purge: LoanPurge) -> AppResult<PurgeReport>;

    /// Latest slot with a completed run of `job`
    async fn last_completed_slot(&self, job: JobKind) -> AppResult<Option<DateTime<Utc>>>;

    async fn begin_job_run(&self, run: &JobRun) -> AppResult<()>;

    async fn finish_job_run(&self, run: &JobRun) -> AppResult<()>;
}

/// Main repository struct holding database connection pool
#[derive(Clone)]
pub struct Repository {
    pub pool: Pool<Postgres>,
    pub items: items::ItemsRepository,
    pub users: users::UsersRepository,
    pub loans: loans::LoansRepository,
    pub jobs: jobs::JobRunsRepository,
}

impl Repository {
    /// Create a new repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            items: items::ItemsRepository::new(pool.clone()),
            users: users::UsersRepository::new(pool.clone()),
            loans: loans::LoansRepository::new(pool.clone()),
            jobs: jobs::JobRunsRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl LedgerStore for Repository {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_loan(&self, loan_id: i64) -> AppResult<Option<Loan>> {
        self.loans.find_by_id(loan_id).await
    }

    async fn loans_for_user(&self, user_id: i64) -> AppResult<Vec<Loan>> {
        self.loans.list_for_user(user_id).await
    }

    async fn find_borrower(&self, user_id: i64) -> AppResult<Option<Borrower>> {
        self.users.find_borrower(user_id).await
    }

    async fn find_item(&self, item_id: i64) -> AppResult<Option<Item>> {
        self.items.find_by_id(item_id).await
    }

    async fn count_active_loans(&self, user_id: i64) -> AppResult<i64> {
        self.loans.count_active_for_user(user_id).await
    }

    async fn outstanding_fees(&self, user_id: i64) -> AppResult<Decimal> {
        self.loans.outstanding_fees(user_id).await
    }

    async fn open_loan(&self, loan: &NewLoan) -> AppResult<OpenLoanOutcome> {
        self.loans.open(loan).await
    }

    async fn close_loan(&self, closure: &LoanClosure) -> AppResult<Option<Loan>> {
        self.loans.close(closure).await
    }

    async fn replace_ban(
        &self,
        user_id: i64,
        expected: Option<DateTime<Utc>>,
        ban_until: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.users.replace_ban(user_id, expected, ban_until).await
    }

    async fn release_item(&self, item_id: i64) -> AppResult<bool> {
        self.items.release(item_id).await
    }

    async fn settle_fee(
        &self,
        loan_id: i64,
        reference: &str,
        settled_at: DateTime<Utc>,
    ) -> AppResult<Option<Loan>> {
        self.loans.settle_fee(loan_id, reference, settled_at).await
    }

    async fn overdue_loans(&self, as_of: DateTime<Utc>, after_id: i64, limit: i64) -> AppResult<Vec<Loan>> {
        self.loans.overdue(as_of, after_id, limit).await
    }

    async fn record_overdue_fee(&self, loan_id: i64, days_late: i64, fee_amount: Decimal) -> AppResult<bool> {
        self.loans.record_overdue_fee(loan_id, days_late, fee_amount).await
    }

    async fn reminder_candidates(
        &self,
        window: DueWindow,
        after_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ReminderTarget>> {
        self.loans.reminder_candidates(window, after_id, limit).await
    }

    async fn claim_reminder(&self, loan_id: i64) -> AppResult<bool> {
        self.loans.claim_reminder(loan_id).await
    }

    async fn release_reminder(&self, loan_id: i64) -> AppResult<()> {
        self.loans.release_reminder(loan_id).await
    }

    async fn purge_loans(&self, purge: LoanPurge) -> AppResult<PurgeReport> {
        self.loans.purge(purge).await
    }

    async fn last_completed_slot(&self, job: JobKind) -> AppResult<Option<DateTime<Utc>>> {
        self.jobs.last_completed_slot(job).await
    }

    async fn begin_job_run(&self, run: &JobRun) -> AppResult<()> {
        self.jobs.insert(run).await
    }

    async fn finish_job_run(&self, run: &JobRun) -> AppResult<()> {
        self.jobs.finish(run).await
    }
}
