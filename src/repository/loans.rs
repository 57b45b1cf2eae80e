//! Loans repository for database operations

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::loan::{
        Loan, LoanClosure, LoanPurge, NewLoan, OpenLoanOutcome, PurgeReport, PurgeStep,
        ReminderTarget,
    },
};

use super::DueWindow;

#[derive(Clone)]
pub struct LoansRepository {
    pool: Pool<Postgres>,
}

impl LoansRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get loan by ID
    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    /// Get all loans for a user, newest first
    pub async fn list_for_user(&self, user_id: i64) -> AppResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(
            "SELECT * FROM loans WHERE user_id = $1 ORDER BY loan_date DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(loans)
    }

    /// Count active loans of a user
    pub async fn count_active_for_user(&self, user_id: i64) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE user_id = $1 AND is_returned = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Total of unpaid fees of a user
    pub async fn outstanding_fees(&self, user_id: i64) -> AppResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(fee_amount), 0)
            FROM loans
            WHERE user_id = $1 AND fee_amount > 0 AND fee_paid = FALSE
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// Reserve the item and create the loan in one transaction
    pub async fn open(&self, loan: &NewLoan) -> AppResult<OpenLoanOutcome> {
        let mut tx = self.pool.begin().await?;

        // Lock the borrower row so concurrent borrows by one user serialize on the cap check
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(loan.user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE user_id = $1 AND is_returned = FALSE",
        )
        .bind(loan.user_id)
        .fetch_one(&mut *tx)
        .await?;

        if active >= loan.max_active_loans {
            tx.rollback().await?;
            return Ok(OpenLoanOutcome::LimitReached);
        }

        let reserved = sqlx::query(
            "UPDATE items SET available = FALSE WHERE id = $1 AND available = TRUE",
        )
        .bind(loan.item_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if reserved == 0 {
            tx.rollback().await?;
            return Ok(OpenLoanOutcome::ItemTaken);
        }

        let inserted = sqlx::query_as::<_, Loan>(
            r#"
            INSERT INTO loans (user_id, item_id, loan_date, due_date)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(loan.user_id)
        .bind(loan.item_id)
        .bind(loan.loan_date)
        .bind(loan.due_date)
        .fetch_one(&mut *tx)
        .await;

        let created = match inserted {
            Ok(created) => created,
            // Another active loan already references this item
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(OpenLoanOutcome::ItemTaken);
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;

        Ok(OpenLoanOutcome::Opened(created))
    }

    /// Mark an active loan as returned with its final penalty
    pub async fn close(&self, closure: &LoanClosure) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET is_returned = TRUE, return_date = $2, days_late = $3, fee_amount = $4
            WHERE id = $1 AND is_returned = FALSE
            RETURNING *
            "#,
        )
        .bind(closure.loan_id)
        .bind(closure.returned_at)
        .bind(closure.days_late)
        .bind(closure.fee_amount)
        .fetch_optional(&self.pool)
        .await?;
        Ok(loan)
    }

    /// Record a settlement; only applies to returned loans with an unpaid fee
    pub async fn settle_fee(
        &self,
        loan_id: i64,
        reference: &str,
        settled_at: DateTime<Utc>,
    ) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET fee_paid = TRUE, fee_payment_reference = $2, fee_paid_at = $3
            WHERE id = $1 AND is_returned = TRUE AND fee_amount > 0 AND fee_paid = FALSE
            RETURNING *
            "#,
        )
        .bind(loan_id)
        .bind(reference)
        .bind(settled_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(loan)
    }

    /// Active loans past due, one chunk at a time
    pub async fn overdue(&self, as_of: DateTime<Utc>, after_id: i64, limit: i64) -> AppResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(
            r#"
            SELECT * FROM loans
            WHERE is_returned = FALSE AND due_date < $1 AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(as_of)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(loans)
    }

    /// Refresh the displayed fee of a still-active loan
    pub async fn record_overdue_fee(&self, loan_id: i64, days_late: i64, fee_amount: Decimal) -> AppResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE loans SET days_late = $2, fee_amount = $3
            WHERE id = $1 AND is_returned = FALSE
            "#,
        )
        .bind(loan_id)
        .bind(days_late)
        .bind(fee_amount)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Loans due inside the window that still need a reminder
    pub async fn reminder_candidates(
        &self,
        window: DueWindow,
        after_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ReminderTarget>> {
        let targets = sqlx::query_as::<_, ReminderTarget>(
            r#"
            SELECT l.id AS loan_id, l.due_date, u.email, u.username, i.title
            FROM loans l
            JOIN users u ON u.id = l.user_id
            LEFT JOIN items i ON i.id = l.item_id
            WHERE l.is_returned = FALSE
              AND l.reminder_sent = FALSE
              AND l.due_date >= $1 AND l.due_date < $2
              AND l.id > $3
            ORDER BY l.id
            LIMIT $4
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(targets)
    }

    pub async fn claim_reminder(&self, loan_id: i64) -> AppResult<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE loans SET reminder_sent = TRUE
            WHERE id = $1 AND reminder_sent = FALSE AND is_returned = FALSE
            "#,
        )
        .bind(loan_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed > 0)
    }

    pub async fn release_reminder(&self, loan_id: i64) -> AppResult<()> {
        sqlx::query("UPDATE loans SET reminder_sent = FALSE WHERE id = $1")
            .bind(loan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Administrative cascade, steps applied in order within one transaction
    pub async fn purge(&self, purge: LoanPurge) -> AppResult<PurgeReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = PurgeReport::default();

        for step in purge.steps() {
            match (step, purge) {
                (PurgeStep::RestoreHeldItems, LoanPurge::Borrower(user_id)) => {
                    report.items_restored += sqlx::query(
                        r#"
                        UPDATE items SET available = TRUE
                        WHERE id IN (
                            SELECT item_id FROM loans WHERE user_id = $1 AND is_returned = FALSE
                        )
                        "#,
                    )
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
                (PurgeStep::RestoreHeldItems, LoanPurge::Item(_)) => {}
                (PurgeStep::DeleteLoans, LoanPurge::Borrower(user_id)) => {
                    report.loans_deleted += sqlx::query("DELETE FROM loans WHERE user_id = $1")
                        .bind(user_id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
                (PurgeStep::DeleteLoans, LoanPurge::Item(item_id)) => {
                    report.loans_deleted += sqlx::query("DELETE FROM loans WHERE item_id = $1")
                        .bind(item_id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
            }
        }

        tx.commit().await?;

        Ok(report)
    }
}
