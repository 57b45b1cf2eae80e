//! Data models for the circulation server

pub mod item;
pub mod job;
pub mod loan;
pub mod user;

// Re-export commonly used types
pub use item::Item;
pub use job::{JobKind, JobReport, JobRun, JobRunStatus, RunOutcome};
pub use loan::{Loan, LoanDetails, LoanStatus};
pub use user::{Borrower, Role, UserClaims};
