//! Reconciliation job bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two nightly reconciliation jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    OverdueFees,
    DueReminders,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::OverdueFees => "overdue_fees",
            JobKind::DueReminders => "due_reminders",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Succeeded,
    /// Stopped at its batch limit with candidates left
    Incomplete,
    Failed,
    TimedOut,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Succeeded => "succeeded",
            JobRunStatus::Incomplete => "incomplete",
            JobRunStatus::Failed => "failed",
            JobRunStatus::TimedOut => "timed_out",
        }
    }

    /// Only a run that drained its candidates completes the slot. Any other
    /// outcome leaves the slot open and the next poll resumes it.
    pub fn completes_slot(&self) -> bool {
        matches!(self, JobRunStatus::Succeeded)
    }
}

/// How far a job run got through its candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Drained,
    /// Batch limit reached; the job resumes after its last processed record
    MoreRemaining,
}

/// Counters produced by one job run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// Records examined
    pub processed: u64,
    /// Records written (fees recomputed, reminders sent)
    pub updated: u64,
    /// Records that failed and stay in their previous state
    pub failed: u64,
}

/// One execution of a job for a scheduled slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job: JobKind,
    /// The trigger instant this run serves
    pub slot: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobRunStatus,
    pub report: JobReport,
}

impl JobRun {
    pub fn begin(job: JobKind, slot: DateTime<Utc>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            slot,
            started_at,
            finished_at: None,
            status: JobRunStatus::Running,
            report: JobReport::default(),
        }
    }

    pub fn finish(&mut self, status: JobRunStatus, report: JobReport, finished_at: DateTime<Utc>) {
        self.status = status;
        self.report = report;
        self.finished_at = Some(finished_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_succeeded_runs_complete_their_slot() {
        assert!(JobRunStatus::Succeeded.completes_slot());
        for status in [
            JobRunStatus::Running,
            JobRunStatus::Incomplete,
            JobRunStatus::Failed,
            JobRunStatus::TimedOut,
        ] {
            assert!(!status.completes_slot(), "{}", status.as_str());
        }
    }
}
