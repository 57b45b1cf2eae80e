//! In-process ledger store.
//!
//! Holds all state behind one async mutex, so each method is trivially atomic.
//! Used by the test suites and for running the service without a database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::{
    error::AppResult,
    models::{
        item::Item,
        job::{JobKind, JobRun},
        loan::{Loan, LoanClosure, LoanPurge, NewLoan, OpenLoanOutcome, PurgeReport, PurgeStep, ReminderTarget},
        user::Borrower,
    },
};

use super::{DueWindow, LedgerStore};

#[derive(Default)]
struct MemoryState {
    borrowers: BTreeMap<i64, Borrower>,
    items: BTreeMap<i64, Item>,
    loans: BTreeMap<i64, Loan>,
    job_runs: Vec<JobRun>,
    next_loan_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_borrower(&self, borrower: Borrower) {
        self.state.lock().await.borrowers.insert(borrower.id, borrower);
    }

    pub async fn add_item(&self, item: Item) {
        self.state.lock().await.items.insert(item.id, item);
    }

    /// Insert a loan record as-is (e.g. an already overdue one)
    pub async fn insert_loan(&self, loan: Loan) {
        let mut state = self.state.lock().await;
        state.next_loan_id = state.next_loan_id.max(loan.id);
        state.loans.insert(loan.id, loan);
    }

    pub async fn loan(&self, loan_id: i64) -> Option<Loan> {
        self.state.lock().await.loans.get(&loan_id).cloned()
    }

    pub async fn item(&self, item_id: i64) -> Option<Item> {
        self.state.lock().await.items.get(&item_id).cloned()
    }

    pub async fn borrower(&self, user_id: i64) -> Option<Borrower> {
        self.state.lock().await.borrowers.get(&user_id).cloned()
    }

    pub async fn job_runs(&self) -> Vec<JobRun> {
        self.state.lock().await.job_runs.clone()
    }
}

fn active_count(state: &MemoryState, user_id: i64) -> i64 {
    state
        .loans
        .values()
        .filter(|l| l.user_id == user_id && l.is_active())
        .count() as i64
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_loan(&self, loan_id: i64) -> AppResult<Option<Loan>> {
        Ok(self.loan(loan_id).await)
    }

    async fn loans_for_user(&self, user_id: i64) -> AppResult<Vec<Loan>> {
        let state = self.state.lock().await;
        let mut loans: Vec<Loan> = state
            .loans
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        loans.sort_by(|a, b| b.loan_date.cmp(&a.loan_date).then(b.id.cmp(&a.id)));
        Ok(loans)
    }

    async fn find_borrower(&self, user_id: i64) -> AppResult<Option<Borrower>> {
        Ok(self.borrower(user_id).await)
    }

    async fn find_item(&self, item_id: i64) -> AppResult<Option<Item>> {
        Ok(self.item(item_id).await)
    }

    async fn count_active_loans(&self, user_id: i64) -> AppResult<i64> {
        Ok(active_count(&*self.state.lock().await, user_id))
    }

    async fn outstanding_fees(&self, user_id: i64) -> AppResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .loans
            .values()
            .filter(|l| l.user_id == user_id && l.fee_amount > Decimal::ZERO && !l.fee_paid)
            .map(|l| l.fee_amount)
            .sum())
    }

    async fn open_loan(&self, loan: &NewLoan) -> AppResult<OpenLoanOutcome> {
        let mut state = self.state.lock().await;

        if active_count(&state, loan.user_id) >= loan.max_active_loans {
            return Ok(OpenLoanOutcome::LimitReached);
        }

        match state.items.get_mut(&loan.item_id) {
            Some(item) if item.available => item.available = false,
            _ => return Ok(OpenLoanOutcome::ItemTaken),
        }

        state.next_loan_id += 1;
        let created = Loan::open(state.next_loan_id, loan);
        state.loans.insert(created.id, created.clone());

        Ok(OpenLoanOutcome::Opened(created))
    }

    async fn close_loan(&self, closure: &LoanClosure) -> AppResult<Option<Loan>> {
        let mut state = self.state.lock().await;
        let Some(loan) = state.loans.get_mut(&closure.loan_id).filter(|l| l.is_active()) else {
            return Ok(None);
        };

        loan.is_returned = true;
        loan.return_date = Some(closure.returned_at);
        loan.days_late = closure.days_late;
        loan.fee_amount = closure.fee_amount;

        Ok(Some(loan.clone()))
    }

    async fn replace_ban(
        &self,
        user_id: i64,
        expected: Option<DateTime<Utc>>,
        ban_until: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        match state.borrowers.get_mut(&user_id) {
            Some(borrower) if borrower.ban_until == expected => {
                borrower.ban_until = Some(ban_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_item(&self, item_id: i64) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.items.get_mut(&item_id) {
            Some(item) => {
                item.available = true;
                true
            }
            None => false,
        })
    }

    async fn settle_fee(
        &self,
        loan_id: i64,
        reference: &str,
        settled_at: DateTime<Utc>,
    ) -> AppResult<Option<Loan>> {
        let mut state = self.state.lock().await;
        let Some(loan) = state
            .loans
            .get_mut(&loan_id)
            .filter(|l| l.is_returned && l.fee_amount > Decimal::ZERO && !l.fee_paid)
        else {
            return Ok(None);
        };

        loan.fee_paid = true;
        loan.fee_payment_reference = Some(reference.to_string());
        loan.fee_paid_at = Some(settled_at);

        Ok(Some(loan.clone()))
    }

    async fn overdue_loans(&self, as_of: DateTime<Utc>, after_id: i64, limit: i64) -> AppResult<Vec<Loan>> {
        let state = self.state.lock().await;
        Ok(state
            .loans
            .range(after_id + 1..)
            .map(|(_, l)| l)
            .filter(|l| l.is_active() && l.due_date < as_of)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_overdue_fee(&self, loan_id: i64, days_late: i64, fee_amount: Decimal) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.loans.get_mut(&loan_id).filter(|l| l.is_active()) {
            Some(loan) => {
                loan.days_late = days_late;
                loan.fee_amount = fee_amount;
                true
            }
            None => false,
        })
    }

    async fn reminder_candidates(
        &self,
        window: DueWindow,
        after_id: i64,
        limit: i64,
    ) -> AppResult<Vec<ReminderTarget>> {
        let state = self.state.lock().await;
        Ok(state
            .loans
            .range(after_id + 1..)
            .map(|(_, l)| l)
            .filter(|l| l.is_active() && !l.reminder_sent && window.contains(l.due_date))
            .filter_map(|l| {
                let borrower = state.borrowers.get(&l.user_id)?;
                Some(ReminderTarget {
                    loan_id: l.id,
                    due_date: l.due_date,
                    email: borrower.email.clone(),
                    username: borrower.username.clone(),
                    title: state.items.get(&l.item_id).map(|i| i.title.clone()),
                })
            })
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn claim_reminder(&self, loan_id: i64) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.loans.get_mut(&loan_id) {
            Some(loan) if loan.is_active() && !loan.reminder_sent => {
                loan.reminder_sent = true;
                true
            }
            _ => false,
        })
    }

    async fn release_reminder(&self, loan_id: i64) -> AppResult<()> {
        if let Some(loan) = self.state.lock().await.loans.get_mut(&loan_id) {
            loan.reminder_sent = false;
        }
        Ok(())
    }

    async fn purge_loans(&self, purge: LoanPurge) -> AppResult<PurgeReport> {
        let mut state = self.state.lock().await;
        let mut report = PurgeReport::default();

        let covers = |loan: &Loan| match purge {
            LoanPurge::Borrower(user_id) => loan.user_id == user_id,
            LoanPurge::Item(item_id) => loan.item_id == item_id,
        };

        for step in purge.steps() {
            match step {
                PurgeStep::RestoreHeldItems => {
                    let held: Vec<i64> = state
                        .loans
                        .values()
                        .filter(|l| covers(*l) && l.is_active())
                        .map(|l| l.item_id)
                        .collect();
                    for item_id in held {
                        if let Some(item) = state.items.get_mut(&item_id) {
                            item.available = true;
                            report.items_restored += 1;
                        }
                    }
                }
                PurgeStep::DeleteLoans => {
                    let before = state.loans.len();
                    state.loans.retain(|_, l| !covers(&*l));
                    report.loans_deleted += (before - state.loans.len()) as u64;
                }
            }
        }

        Ok(report)
    }

    async fn last_completed_slot(&self, job: JobKind) -> AppResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .job_runs
            .iter()
            .filter(|r| r.job == job && r.status.completes_slot())
            .map(|r| r.slot)
            .max())
    }

    async fn begin_job_run(&self, run: &JobRun) -> AppResult<()> {
        self.state.lock().await.job_runs.push(run.clone());
        Ok(())
    }

    async fn finish_job_run(&self, run: &JobRun) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.job_runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run.clone();
        }
        Ok(())
    }
}
