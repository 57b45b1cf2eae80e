//! Notification gateway

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{AppError, AppResult};

/// Outbound messages to borrowers. Callers treat every send as fire-and-forget:
/// an error is logged and never changes loan state on its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell a borrower their loan is due tomorrow
    async fn send_reminder(
        &self,
        to: &str,
        username: &str,
        book_title: &str,
        due_date: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Confirm that a late fee was settled
    async fn send_penalty_receipt(&self, to: &str, loan_summary: &str, amount: Decimal) -> AppResult<()>;
}

/// Notifier used when outbound email is disabled.
///
/// Reminders fail so the reminder job releases its claim and the loan is still
/// reminded once email is enabled. Receipts are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_reminder(
        &self,
        to: &str,
        username: &str,
        book_title: &str,
        due_date: DateTime<Utc>,
    ) -> AppResult<()> {
        tracing::debug!(
            recipient = to,
            user = username,
            book = book_title,
            due_date = %due_date,
            "Email disabled; reminder not sent"
        );
        Err(AppError::Notification("email delivery is disabled".to_string()))
    }

    async fn send_penalty_receipt(&self, to: &str, loan_summary: &str, amount: Decimal) -> AppResult<()> {
        tracing::info!(
            recipient = to,
            summary = loan_summary,
            amount = %amount,
            "Email disabled; penalty receipt not sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_log_notifier_does_not_report_reminders_as_delivered() {
        let due = Utc.with_ymd_and_hms(2024, 6, 2, 9, 0, 0).unwrap();
        let result = LogNotifier.send_reminder("a@example.org", "ayse", "Dune", due).await;
        assert!(matches!(result, Err(AppError::Notification(_))));

        LogNotifier
            .send_penalty_receipt("a@example.org", "Loan #1", Decimal::from(10))
            .await
            .unwrap();
    }
}
