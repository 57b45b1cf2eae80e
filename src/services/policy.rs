//! Penalty and ban policy
//!
//! Pure functions over the policy constants. Nothing here touches storage, so the
//! request path and the nightly reconciliation compute identical values.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::config::LoanPolicyConfig;

/// Milliseconds in one day
pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyPolicy {
    pub fee_per_day: Decimal,
    pub ban_multiplier: i64,
    pub currency: String,
}

impl PenaltyPolicy {
    pub fn new(fee_per_day: Decimal, ban_multiplier: i64, currency: impl Into<String>) -> Self {
        Self {
            fee_per_day,
            ban_multiplier,
            currency: currency.into(),
        }
    }

    /// Whole days late, rounded up; zero for on-time or early returns.
    pub fn days_late(&self, due: DateTime<Utc>, as_of: DateTime<Utc>) -> i64 {
        let late_ms = (as_of - due).num_milliseconds();
        if late_ms <= 0 {
            0
        } else {
            (late_ms + MS_PER_DAY - 1) / MS_PER_DAY
        }
    }

    pub fn fee(&self, days_late: i64) -> Decimal {
        if days_late <= 0 {
            Decimal::ZERO
        } else {
            self.fee_per_day * Decimal::from(days_late)
        }
    }

    /// New ban end for an infraction of `days_late` committed at `as_of`.
    ///
    /// Bans stack: the extension is anchored at the later of the current ban end
    /// and `as_of`, so an existing ban is never shortened.
    pub fn extend_ban(
        &self,
        current: Option<DateTime<Utc>>,
        days_late: i64,
        as_of: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if days_late <= 0 {
            return current;
        }
        let anchor = current.map_or(as_of, |until| until.max(as_of));
        Some(anchor + Duration::days(days_late * self.ban_multiplier))
    }

    /// Human-readable fee summary returned to the borrower
    pub fn summary(&self, days_late: i64, fee: Decimal) -> String {
        if days_late <= 0 {
            "Returned on time. No late fee.".to_string()
        } else {
            format!(
                "Returned {} day(s) late. Late fee: {} {}. Borrowing suspension extended by {} day(s).",
                days_late,
                fee.round_dp(2),
                self.currency,
                days_late * self.ban_multiplier
            )
        }
    }
}

impl From<&LoanPolicyConfig> for PenaltyPolicy {
    fn from(config: &LoanPolicyConfig) -> Self {
        Self::new(config.fee_per_day, config.ban_multiplier, config.currency.clone())
    }
}
