//! Business logic services

pub mod admission;
pub mod clock;
pub mod email;
pub mod loans;
pub mod notifier;
pub mod policy;
pub mod reconciliation;
pub mod scheduler;

use std::{sync::Arc, time::Duration};

use crate::{
    config::{AppConfig, SchedulerConfig},
    error::AppResult,
    repository::LedgerStore,
};

use self::{
    admission::AdmissionController,
    clock::Clock,
    notifier::Notifier,
    policy::PenaltyPolicy,
    reconciliation::{BatchLimits, OverdueFeeJob, ReminderJob},
    scheduler::{DailySchedule, ScheduledTask, Scheduler},
};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub loans: loans::LoansService,
    pub store: Arc<dyn LedgerStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Create all services over the given store and gateways
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            loans: loans::LoansService::new(
                store.clone(),
                notifier.clone(),
                AdmissionController::new(config.loans.max_active_loans),
                PenaltyPolicy::from(&config.loans),
            ),
            store,
            notifier,
            clock,
        }
    }

    /// Build the scheduler running the overdue fee and reminder jobs
    pub fn scheduler(&self, config: &SchedulerConfig) -> AppResult<Scheduler> {
        let offset = config.reference_offset()?;
        let limits = BatchLimits::from(config);
        let timeout = Duration::from_secs(config.job_timeout_secs);

        let overdue_fees = OverdueFeeJob::new(self.store.clone(), self.loans.policy().clone(), limits);
        let reminders = ReminderJob::new(self.store.clone(), self.notifier.clone(), offset, limits);

        let tasks = vec![
            ScheduledTask::new(
                Arc::new(overdue_fees),
                DailySchedule::new(config.overdue_fees_time()?, offset),
                self.store.clone(),
                self.clock.clone(),
                timeout,
            ),
            ScheduledTask::new(
                Arc::new(reminders),
                DailySchedule::new(config.reminders_time()?, offset),
                self.store.clone(),
                self.clock.clone(),
                timeout,
            ),
        ];

        Ok(Scheduler::new(
            tasks,
            Duration::from_secs(config.poll_interval_secs.max(1)),
        ))
    }
}
