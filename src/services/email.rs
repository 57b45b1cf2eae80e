//! Email service for loan reminders and penalty receipts

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use lettre::{
    message::{header::ContentType, Mailbox, Message, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    SmtpTransport, Transport,
};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::{
    config::EmailConfig,
    error::{AppError, AppResult},
    services::{notifier::Notifier, policy::PenaltyPolicy},
};

#[derive(Clone)]
pub struct EmailService {
    config: EmailConfig,
    policy: PenaltyPolicy,
    /// Library timezone used for dates shown to borrowers
    offset: FixedOffset,
}

impl EmailService {
    pub fn new(config: EmailConfig, policy: PenaltyPolicy, offset: FixedOffset) -> Self {
        Self { config, policy, offset }
    }

    fn reminder_body(&self, username: &str, book_title: &str, due_date: DateTime<Utc>) -> String {
        format!(
            r#"
Hello {username},

Your borrowed book "{title}" is due TOMORROW.

Due date: {due}

Please remember to return the book on time. Late returns cost {fee} {currency}
per day and suspend borrowing for a while.
"#,
            username = username,
            title = book_title,
            due = due_date.with_timezone(&self.offset).format("%Y-%m-%d %H:%M (UTC%:z)"),
            fee = self.policy.fee_per_day.round_dp(2),
            currency = self.policy.currency,
        )
    }

    fn receipt_body(&self, loan_summary: &str, amount: Decimal) -> String {
        format!(
            r#"
Hello,

Your late return fee has been paid.

Loan: {summary}
Amount paid: {amount} {currency}

Thank you. Remember to return your books on time.
"#,
            summary = loan_summary,
            amount = amount.round_dp(2),
            currency = self.policy.currency,
        )
    }

    fn build_message(&self, to: &str, subject: &str, body: &str) -> AppResult<Message> {
        let from_name = self
            .config
            .smtp_from_name
            .as_deref()
            .unwrap_or("Library");
        let from_mailbox = Mailbox::from_str(&format!("{} <{}>", from_name, self.config.smtp_from))
            .map_err(|e| AppError::Notification(format!("Invalid from address: {}", e)))?;

        let to_mailbox = Mailbox::from_str(to)
            .map_err(|e| AppError::Notification(format!("Invalid to address: {}", e)))?;

        Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(body.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(format!(
                                r#"<html><body><pre>{}</pre></body></html>"#,
                                escape_html(body)
                            )),
                    ),
            )
            .map_err(|e| AppError::Notification(format!("Failed to build email: {}", e)))
    }

    fn mailer(&self) -> AppResult<SmtpTransport> {
        let mailer_builder = if self.config.smtp_use_tls {
            SmtpTransport::starttls_relay(&self.config.smtp_host).map_err(|e| {
                AppError::Notification(format!("Failed to create SMTP transport: {}", e))
            })?
        } else {
            SmtpTransport::builder_dangerous(&self.config.smtp_host)
        }
        .port(self.config.smtp_port);

        let mailer_builder = if let (Some(username), Some(password)) =
            (&self.config.smtp_username, &self.config.smtp_password)
        {
            mailer_builder.credentials(Credentials::new(username.clone(), password.clone()))
        } else {
            mailer_builder
        };

        Ok(mailer_builder.build())
    }

    /// Generic email sending function. SMTP is blocking, so it runs off the async workers.
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> AppResult<()> {
        let email = self.build_message(to, subject, body)?;
        let mailer = self.mailer()?;

        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::Internal(format!("Email task failed: {}", e)))?
            .map_err(|e| AppError::Notification(format!("Failed to send email: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailService {
    async fn send_reminder(
        &self,
        to: &str,
        username: &str,
        book_title: &str,
        due_date: DateTime<Utc>,
    ) -> AppResult<()> {
        let body = self.reminder_body(username, book_title, due_date);
        self.send_email(to, "Book Return Reminder - Due Tomorrow", &body).await
    }

    async fn send_penalty_receipt(&self, to: &str, loan_summary: &str, amount: Decimal) -> AppResult<()> {
        let body = self.receipt_body(loan_summary, amount);
        self.send_email(to, "Payment Confirmation - Late Return Fee", &body).await
    }
}

/// Escape text for inclusion in the HTML part. `<pre>` keeps the line breaks.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> EmailService {
        EmailService::new(
            EmailConfig::default(),
            PenaltyPolicy::new(Decimal::from(5), 2, "TRY"),
            FixedOffset::east_opt(3 * 3600).unwrap(),
        )
    }

    #[test]
    fn test_reminder_body_greets_borrower_in_library_time() {
        let due = Utc.with_ymd_and_hms(2024, 6, 2, 9, 0, 0).unwrap();
        let body = service().reminder_body("ayse", "Kuyucakli Yusuf", due);
        assert!(body.contains("Hello ayse,"));
        assert!(body.contains("\"Kuyucakli Yusuf\""));
        assert!(body.contains("2024-06-02 12:00 (UTC+03:00)"));
        assert!(body.contains("5 TRY"));
    }

    #[test]
    fn test_html_part_escapes_markup() {
        assert_eq!(
            escape_html("<b>Tom & \"Jerry\"</b>"),
            "&lt;b&gt;Tom &amp; &quot;Jerry&quot;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_receipt_body_includes_amount() {
        let body = service().receipt_body("Loan #4", Decimal::from(15));
        assert!(body.contains("Amount paid: 15 TRY"));
    }

    #[test]
    fn test_invalid_recipient_is_a_notification_error() {
        let result = service().build_message("not an address", "subject", "body");
        assert!(matches!(result, Err(AppError::Notification(_))));
    }
}
