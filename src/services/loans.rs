//! Loan management service

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::{
    error::{AppError, AppResult, Rejection},
    models::{
        loan::{BorrowRequest, Loan, LoanClosure, LoanDetails, LoanPurge, NewLoan, OpenLoanOutcome, PurgeReport, ReturnOutcome},
        user::Borrower,
    },
    repository::LedgerStore,
    services::{
        admission::{AdmissionController, BorrowerStanding},
        notifier::Notifier,
        policy::PenaltyPolicy,
    },
};

/// Compare-and-set attempts on a borrower's ban before giving up
const BAN_UPDATE_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct LoansService {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    admission: AdmissionController,
    policy: PenaltyPolicy,
}

impl LoansService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        admission: AdmissionController,
        policy: PenaltyPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            admission,
            policy,
        }
    }

    pub fn policy(&self) -> &PenaltyPolicy {
        &self.policy
    }

    /// Get loan by ID
    pub async fn get_loan(&self, loan_id: i64) -> AppResult<Loan> {
        Ok(self
            .store
            .find_loan(loan_id)
            .await?
            .ok_or(Rejection::LoanNotFound { loan_id })?)
    }

    /// Create a new loan (borrow an item)
    pub async fn try_borrow(&self, request: &BorrowRequest, now: DateTime<Utc>) -> AppResult<Loan> {
        let borrower = self
            .store
            .find_borrower(request.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", request.user_id)))?;

        let standing = BorrowerStanding {
            active_loans: self.store.count_active_loans(borrower.id).await?,
            outstanding_fees: self.store.outstanding_fees(borrower.id).await?,
            borrower,
        };
        let item = self.store.find_item(request.item_id).await?;

        let due_date = self
            .admission
            .evaluate(&standing, request.item_id, item.as_ref(), request.due_date.as_deref(), now)
            .inspect_err(|rejection| {
                tracing::info!(
                    user_id = request.user_id,
                    item_id = request.item_id,
                    %rejection,
                    "Borrow rejected"
                );
            })?;

        let new_loan = NewLoan {
            user_id: request.user_id,
            item_id: request.item_id,
            loan_date: now,
            due_date,
            max_active_loans: self.admission.max_active_loans,
        };

        match self.store.open_loan(&new_loan).await? {
            OpenLoanOutcome::Opened(loan) => {
                tracing::info!(
                    loan_id = loan.id,
                    user_id = loan.user_id,
                    item_id = loan.item_id,
                    due_date = %loan.due_date,
                    "Loan created"
                );
                Ok(loan)
            }
            OpenLoanOutcome::ItemTaken => Err(Rejection::ItemUnavailable {
                item_id: request.item_id,
            }
            .into()),
            OpenLoanOutcome::LimitReached => Err(Rejection::ActiveLoanLimitReached {
                limit: self.admission.max_active_loans,
            }
            .into()),
        }
    }

    /// Return a borrowed item, fixing the late fee and extending the borrower's ban
    pub async fn return_loan(&self, loan_id: i64, now: DateTime<Utc>) -> AppResult<ReturnOutcome> {
        let loan = self
            .store
            .find_loan(loan_id)
            .await?
            .ok_or(Rejection::LoanNotFound { loan_id })?;

        if loan.is_returned {
            return Err(Rejection::AlreadyReturned {
                loan_id,
                returned_at: loan.return_date,
            }
            .into());
        }

        let borrower = match self.store.find_borrower(loan.user_id).await? {
            Some(borrower) if !borrower.role.is_admin() => borrower,
            Some(_) => {
                tracing::error!(loan_id, user_id = loan.user_id, "Active loan held by an administrative account");
                return Err(AppError::InvariantViolation(format!(
                    "loan {} is held by an administrative account",
                    loan_id
                )));
            }
            None => {
                tracing::error!(loan_id, user_id = loan.user_id, "Active loan references a missing user");
                return Err(AppError::InvariantViolation(format!(
                    "loan {} references missing user {}",
                    loan_id, loan.user_id
                )));
            }
        };

        let days_late = self.policy.days_late(loan.due_date, now);
        let fee_amount = self.policy.fee(days_late);

        let closure = LoanClosure {
            loan_id,
            returned_at: now,
            days_late,
            fee_amount,
        };

        let Some(closed) = self.store.close_loan(&closure).await? else {
            // A concurrent return won
            let returned_at = self.store.find_loan(loan_id).await?.and_then(|l| l.return_date);
            return Err(Rejection::AlreadyReturned { loan_id, returned_at }.into());
        };

        let ban_until = if days_late > 0 {
            match self.extend_ban(&borrower, days_late, now).await {
                Ok(ban_until) => ban_until,
                Err(e) => {
                    tracing::error!(
                        loan_id,
                        user_id = borrower.id,
                        days_late,
                        error = %e,
                        "Loan closed but ban extension failed"
                    );
                    borrower.ban_until
                }
            }
        } else {
            borrower.ban_until
        };
        let ban_until = ban_until.filter(|until| *until > now);

        match self.store.release_item(closed.item_id).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(loan_id, item_id = closed.item_id, "Returned item no longer exists"),
            Err(e) => tracing::error!(
                loan_id,
                item_id = closed.item_id,
                error = %e,
                "Loan closed but item availability was not restored"
            ),
        }

        tracing::info!(loan_id, user_id = borrower.id, days_late, fee = %fee_amount, "Loan returned");

        Ok(ReturnOutcome {
            days_late,
            fee_amount,
            ban_until,
            settlement_required: fee_amount > Decimal::ZERO,
            summary: self.policy.summary(days_late, fee_amount),
            loan: closed,
        })
    }

    /// Stack a late-return ban onto whatever ban the borrower holds right now
    async fn extend_ban(
        &self,
        borrower: &Borrower,
        days_late: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let mut current = borrower.ban_until;

        for _ in 0..BAN_UPDATE_ATTEMPTS {
            let Some(next) = self.policy.extend_ban(current, days_late, now) else {
                return Ok(current);
            };
            if self.store.replace_ban(borrower.id, current, next).await? {
                return Ok(Some(next));
            }
            current = self
                .store
                .find_borrower(borrower.id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("User {} not found", borrower.id)))?
                .ban_until;
        }

        Err(AppError::Internal(format!(
            "ban of user {} changed concurrently {} times",
            borrower.id, BAN_UPDATE_ATTEMPTS
        )))
    }

    /// Record that a late fee was paid. Repeating a settlement is a no-op.
    pub async fn settle_fee(
        &self,
        loan_id: i64,
        reference: &str,
        settled_at: DateTime<Utc>,
    ) -> AppResult<Loan> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(AppError::Validation("payment reference is required".to_string()));
        }

        let loan = self
            .store
            .find_loan(loan_id)
            .await?
            .ok_or(Rejection::LoanNotFound { loan_id })?;

        if loan.fee_paid {
            tracing::info!(loan_id, "Fee already settled");
            return Ok(loan);
        }
        if !loan.is_returned {
            return Err(Rejection::LoanStillActive { loan_id }.into());
        }
        if loan.fee_amount <= Decimal::ZERO {
            return Err(Rejection::FeeNotOwed { loan_id }.into());
        }

        let Some(settled) = self.store.settle_fee(loan_id, reference, settled_at).await? else {
            // Settled by a concurrent call in between
            return self
                .store
                .find_loan(loan_id)
                .await?
                .filter(|l| l.fee_paid)
                .ok_or_else(|| Rejection::FeeNotOwed { loan_id }.into());
        };

        tracing::info!(loan_id, amount = %settled.fee_amount, reference, "Late fee settled");

        self.send_receipt(&settled).await;

        Ok(settled)
    }

    async fn send_receipt(&self, loan: &Loan) {
        let borrower = match self.store.find_borrower(loan.user_id).await {
            Ok(Some(borrower)) if !borrower.email.trim().is_empty() => borrower,
            Ok(_) => {
                tracing::debug!(loan_id = loan.id, "No email address; receipt skipped");
                return;
            }
            Err(e) => {
                tracing::warn!(loan_id = loan.id, error = %e, "Could not load borrower for receipt");
                return;
            }
        };

        let title = match self.store.find_item(loan.item_id).await {
            Ok(Some(item)) => item.title,
            _ => format!("item #{}", loan.item_id),
        };
        let summary = format!("\"{}\", returned {} day(s) late", title, loan.days_late);

        if let Err(e) = self
            .notifier
            .send_penalty_receipt(&borrower.email, &summary, loan.fee_amount)
            .await
        {
            tracing::warn!(loan_id = loan.id, error = %e, "Failed to send penalty receipt");
        }
    }

    /// Get loans for a user, newest first
    pub async fn user_loans(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<Vec<LoanDetails>> {
        // Verify user exists
        self.store
            .find_borrower(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        let loans = self.store.loans_for_user(user_id).await?;
        Ok(loans.into_iter().map(|loan| LoanDetails::at(loan, now)).collect())
    }

    /// Remove the loan records of a user or item about to be deleted
    pub async fn purge(&self, purge: LoanPurge) -> AppResult<PurgeReport> {
        let report = self.store.purge_loans(purge).await?;
        tracing::info!(
            ?purge,
            items_restored = report.items_restored,
            loans_deleted = report.loans_deleted,
            "Loans purged"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{item::Item, loan::LoanStatus, user::Role},
        repository::{MemoryStore, MockLedgerStore},
        services::notifier::MockNotifier,
    };
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn borrower(id: i64, role: Role) -> Borrower {
        Borrower {
            id,
            username: format!("user{}", id),
            email: format!("user{}@example.org", id),
            role,
            ban_until: None,
            is_permanent_ban: false,
        }
    }

    fn overdue_loan(id: i64, user_id: i64, item_id: i64, days: i64) -> Loan {
        Loan::open(
            id,
            &NewLoan {
                user_id,
                item_id,
                loan_date: now() - Duration::days(days + 14),
                due_date: now() - Duration::days(days),
                max_active_loans: 1,
            },
        )
    }

    async fn service(notifier: MockNotifier) -> (LoansService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.add_borrower(borrower(1, Role::Member)).await;
        store.add_borrower(borrower(2, Role::Admin)).await;
        store.add_item(Item { id: 10, title: "Dune".to_string(), available: true }).await;
        let service = LoansService::new(
            store.clone(),
            Arc::new(notifier),
            AdmissionController::new(1),
            PenaltyPolicy::new(Decimal::from(5), 2, "TRY"),
        );
        (service, store)
    }

    #[tokio::test]
    async fn test_late_return_stacks_ban_on_existing_one() {
        let (service, store) = service(MockNotifier::new()).await;
        let existing = now() + Duration::days(4);
        let mut b = borrower(1, Role::Member);
        b.ban_until = Some(existing);
        store.add_borrower(b).await;
        store.add_item(Item { id: 10, title: "Dune".to_string(), available: false }).await;
        store.insert_loan(overdue_loan(5, 1, 10, 3)).await;

        let outcome = service.return_loan(5, now()).await.unwrap();

        assert_eq!(outcome.days_late, 3);
        assert_eq!(outcome.fee_amount, Decimal::from(15));
        assert_eq!(outcome.ban_until, Some(existing + Duration::days(6)));
        assert!(outcome.settlement_required);
        assert!(store.item(10).await.unwrap().available);
    }

    #[tokio::test]
    async fn test_second_return_is_rejected() {
        let (service, store) = service(MockNotifier::new()).await;
        store.insert_loan(overdue_loan(5, 1, 10, 0)).await;

        service.return_loan(5, now()).await.unwrap();
        let err = service.return_loan(5, now()).await.unwrap_err();

        assert!(matches!(
            err.rejection(),
            Some(Rejection::AlreadyReturned { loan_id: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_return_by_admin_holder_is_invariant_violation() {
        let (service, store) = service(MockNotifier::new()).await;
        store.insert_loan(overdue_loan(6, 2, 10, 1)).await;

        let err = service.return_loan(6, now()).await.unwrap_err();

        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert!(store.loan(6).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_settlement_sends_receipt_once() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_penalty_receipt()
            .withf(|to, summary, amount| {
                to.contains("user1@example.org") && summary.contains("Dune") && *amount == Decimal::from(10)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (service, store) = service(notifier).await;
        store.insert_loan(overdue_loan(7, 1, 10, 2)).await;
        service.return_loan(7, now()).await.unwrap();

        let settled = service.settle_fee(7, "PAY-1", now()).await.unwrap();
        let again = service.settle_fee(7, "PAY-2", now()).await.unwrap();

        assert!(settled.fee_paid);
        assert_eq!(again.fee_payment_reference.as_deref(), Some("PAY-1"));
    }

    #[tokio::test]
    async fn test_settlement_rejections() {
        let (service, store) = service(MockNotifier::new()).await;
        store.insert_loan(overdue_loan(8, 1, 10, 2)).await;

        let err = service.settle_fee(8, "PAY-1", now()).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::LoanStillActive { loan_id: 8 }));

        let mut on_time = overdue_loan(9, 1, 11, 0);
        on_time.is_returned = true;
        on_time.return_date = Some(now());
        store.insert_loan(on_time).await;

        let err = service.settle_fee(9, "PAY-1", now()).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::FeeNotOwed { loan_id: 9 }));
    }

    #[tokio::test]
    async fn test_receipt_failure_does_not_fail_settlement() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_penalty_receipt()
            .returning(|_, _, _| Err(AppError::Notification("smtp down".to_string())));
        let (service, store) = service(notifier).await;
        store.insert_loan(overdue_loan(7, 1, 10, 1)).await;
        service.return_loan(7, now()).await.unwrap();

        assert!(service.settle_fee(7, "PAY-1", now()).await.unwrap().fee_paid);
    }

    #[tokio::test]
    async fn test_return_of_deleted_item_still_closes_loan() {
        let (service, store) = service(MockNotifier::new()).await;
        store.insert_loan(overdue_loan(5, 1, 99, 0)).await;

        let outcome = service.return_loan(5, now()).await.unwrap();

        assert_eq!(outcome.days_late, 0);
        assert_eq!(outcome.loan.status(), LoanStatus::ClosedOnTime);
        assert!(store.loan(5).await.unwrap().is_returned);
        assert!(store.item(99).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_ban_update_keeps_the_closed_loan_and_its_fee() {
        let loan = overdue_loan(5, 1, 10, 3);
        let mut store = MockLedgerStore::new();
        store.expect_find_loan().returning({
            let loan = loan.clone();
            move |_| Ok(Some(loan.clone()))
        });
        store
            .expect_find_borrower()
            .returning(|id| Ok(Some(borrower(id, Role::Member))));
        store
            .expect_close_loan()
            .withf(|closure| closure.days_late == 3 && closure.fee_amount == Decimal::from(15))
            .times(1)
            .returning(move |closure| {
                let mut closed = loan.clone();
                closed.is_returned = true;
                closed.return_date = Some(closure.returned_at);
                closed.days_late = closure.days_late;
                closed.fee_amount = closure.fee_amount;
                Ok(Some(closed))
            });
        store
            .expect_replace_ban()
            .times(1)
            .returning(|_, _, _| Err(AppError::Database(sqlx::Error::PoolTimedOut)));
        store.expect_release_item().times(1).returning(|_| Ok(true));
        let service = LoansService::new(
            Arc::new(store),
            Arc::new(MockNotifier::new()),
            AdmissionController::new(1),
            PenaltyPolicy::new(Decimal::from(5), 2, "TRY"),
        );

        let outcome = service.return_loan(5, now()).await.unwrap();

        assert_eq!(outcome.days_late, 3);
        assert_eq!(outcome.fee_amount, Decimal::from(15));
        assert_eq!(outcome.ban_until, None);
        assert_eq!(outcome.loan.status(), LoanStatus::ClosedFeePending);
    }
}
