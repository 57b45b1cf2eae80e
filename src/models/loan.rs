//! Loan (borrow) model and related types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Loan model from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Loan {
    pub id: i64,
    pub user_id: i64,
    pub item_id: i64,
    pub loan_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    pub is_returned: bool,
    pub days_late: i64,
    #[schema(value_type = String)]
    pub fee_amount: Decimal,
    pub fee_paid: bool,
    pub fee_payment_reference: Option<String>,
    pub fee_paid_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
}

impl Loan {
    /// Build an active loan as it is first persisted
    pub fn open(id: i64, new: &NewLoan) -> Self {
        Self {
            id,
            user_id: new.user_id,
            item_id: new.item_id,
            loan_date: new.loan_date,
            due_date: new.due_date,
            return_date: None,
            is_returned: false,
            days_late: 0,
            fee_amount: Decimal::ZERO,
            fee_paid: false,
            fee_payment_reference: None,
            fee_paid_at: None,
            reminder_sent: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_returned
    }

    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.due_date < now
    }

    /// Lifecycle state derived from the record
    pub fn status(&self) -> LoanStatus {
        match (self.is_returned, self.fee_amount > Decimal::ZERO, self.fee_paid) {
            (false, _, _) => LoanStatus::Active,
            (true, false, _) => LoanStatus::ClosedOnTime,
            (true, true, false) => LoanStatus::ClosedFeePending,
            (true, true, true) => LoanStatus::ClosedFeeSettled,
        }
    }
}

/// Loan lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    ClosedOnTime,
    ClosedFeePending,
    ClosedFeeSettled,
}

/// Loan with derived state for display
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoanDetails {
    #[serde(flatten)]
    pub loan: Loan,
    pub status: LoanStatus,
    pub is_overdue: bool,
}

impl LoanDetails {
    pub fn at(loan: Loan, now: DateTime<Utc>) -> Self {
        Self {
            status: loan.status(),
            is_overdue: loan.is_overdue_at(now),
            loan,
        }
    }
}

/// Borrow request as received from a caller; the due date is still raw text
#[derive(Debug, Clone)]
pub struct BorrowRequest {
    pub user_id: i64,
    pub item_id: i64,
    pub due_date: Option<String>,
}

/// A loan that passed admission and is ready to be persisted
#[derive(Debug, Clone)]
pub struct NewLoan {
    pub user_id: i64,
    pub item_id: i64,
    pub loan_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    /// Cap re-checked by the store while it holds the borrower's row
    pub max_active_loans: i64,
}

/// Result of the atomic "reserve item + insert loan" step
#[derive(Debug, Clone)]
pub enum OpenLoanOutcome {
    Opened(Loan),
    ItemTaken,
    LimitReached,
}

/// Fields written when a loan is closed
#[derive(Debug, Clone)]
pub struct LoanClosure {
    pub loan_id: i64,
    pub returned_at: DateTime<Utc>,
    pub days_late: i64,
    pub fee_amount: Decimal,
}

/// Result of returning a loan
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReturnOutcome {
    pub loan: Loan,
    pub days_late: i64,
    #[schema(value_type = String)]
    pub fee_amount: Decimal,
    /// Ban end after this return, when the borrower is (still) banned
    pub ban_until: Option<DateTime<Utc>>,
    /// The caller should prompt the borrower to settle the fee
    pub settlement_required: bool,
    pub summary: String,
}

/// Due-tomorrow loan joined with what the reminder email needs
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ReminderTarget {
    pub loan_id: i64,
    pub due_date: DateTime<Utc>,
    pub email: String,
    pub username: String,
    pub title: Option<String>,
}

/// Administrative cascade over loans. Each variant expands into ordered cleanup steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanPurge {
    /// A user account is being deleted
    Borrower(i64),
    /// An item is being removed from the catalog
    Item(i64),
}

/// One step of a purge, executed in order inside a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStep {
    RestoreHeldItems,
    DeleteLoans,
}

impl LoanPurge {
    pub fn steps(&self) -> &'static [PurgeStep] {
        match self {
            LoanPurge::Borrower(_) => &[PurgeStep::RestoreHeldItems, PurgeStep::DeleteLoans],
            // The item itself is going away; nothing to make available again
            LoanPurge::Item(_) => &[PurgeStep::DeleteLoans],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct PurgeReport {
    pub items_restored: u64,
    pub loans_deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn loan() -> Loan {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        Loan::open(
            1,
            &NewLoan {
                user_id: 2,
                item_id: 3,
                loan_date: now,
                due_date: now + Duration::days(14),
                max_active_loans: 1,
            },
        )
    }

    #[test]
    fn test_status_transitions() {
        let mut loan = loan();
        assert_eq!(loan.status(), LoanStatus::Active);

        loan.is_returned = true;
        loan.return_date = Some(loan.due_date);
        assert_eq!(loan.status(), LoanStatus::ClosedOnTime);

        loan.fee_amount = Decimal::from(15);
        loan.days_late = 3;
        assert_eq!(loan.status(), LoanStatus::ClosedFeePending);

        loan.fee_paid = true;
        assert_eq!(loan.status(), LoanStatus::ClosedFeeSettled);
    }

    #[test]
    fn test_overdue_only_while_active() {
        let mut loan = loan();
        let after_due = loan.due_date + Duration::hours(1);
        assert!(loan.is_overdue_at(after_due));
        assert!(!loan.is_overdue_at(loan.due_date));

        loan.is_returned = true;
        assert!(!loan.is_overdue_at(after_due));
    }

    #[test]
    fn test_purge_steps_are_ordered() {
        assert_eq!(
            LoanPurge::Borrower(1).steps(),
            &[PurgeStep::RestoreHeldItems, PurgeStep::DeleteLoans]
        );
        assert_eq!(LoanPurge::Item(1).steps(), &[PurgeStep::DeleteLoans]);
    }
}
