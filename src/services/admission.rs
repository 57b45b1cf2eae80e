//! Admission control for new loans

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::{
    error::Rejection,
    models::{item::Item, user::Borrower},
};

/// Snapshot of a borrower's standing, read just before admission
#[derive(Debug, Clone)]
pub struct BorrowerStanding {
    pub borrower: Borrower,
    pub active_loans: i64,
    pub outstanding_fees: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionController {
    pub max_active_loans: i64,
}

impl AdmissionController {
    pub fn new(max_active_loans: i64) -> Self {
        Self { max_active_loans }
    }

    /// Run the admission checks in order and return the accepted due date.
    ///
    /// The first failing check decides the rejection.
    pub fn evaluate(
        &self,
        standing: &BorrowerStanding,
        item_id: i64,
        item: Option<&Item>,
        requested_due_date: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Rejection> {
        let borrower = &standing.borrower;

        if borrower.role.is_admin() {
            return Err(Rejection::RoleForbidden { role: borrower.role });
        }

        if borrower.is_banned_at(now) {
            return Err(Rejection::Banned {
                until: borrower.ban_until.filter(|_| !borrower.is_permanent_ban),
                permanent: borrower.is_permanent_ban,
                days_remaining: borrower.ban_days_remaining(now),
            });
        }

        if standing.active_loans >= self.max_active_loans {
            return Err(Rejection::ActiveLoanLimitReached {
                limit: self.max_active_loans,
            });
        }

        if standing.outstanding_fees > Decimal::ZERO {
            return Err(Rejection::UnpaidFeeOutstanding {
                total: standing.outstanding_fees,
            });
        }

        if !item.is_some_and(|item| item.available) {
            return Err(Rejection::ItemUnavailable { item_id });
        }

        let due_date = parse_due_date(requested_due_date)?;
        if due_date <= now {
            return Err(Rejection::InvalidDueDate {
                message: "due date must be in the future".to_string(),
            });
        }

        Ok(due_date)
    }
}

/// Accepts an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_due_date(raw: Option<&str>) -> Result<DateTime<Utc>, Rejection> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
        Rejection::InvalidDueDate {
            message: "a due date is required".to_string(),
        }
    })?;

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| Utc.from_utc_datetime(&date.and_time(NaiveTime::default())))
        .map_err(|_| Rejection::InvalidDueDate {
            message: format!("'{}' is not a valid date", raw),
        })
}
