//! Error types for the circulation server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::models::user::Role;

/// Stable numeric error codes exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    NotAuthorized = 2,
    DbFailure = 3,
    NoSuchUser = 4,
    NoSuchItem = 5,
    ItemNotAvailable = 7,
    MaxBorrowsReached = 11,
    NotBorrowable = 12,
    BadValue = 18,
    NoSuchData = 20,
    UserBanned = 22,
    UnpaidFees = 23,
    AlreadyReturned = 24,
    FeeNotOwed = 25,
    LoanStillActive = 26,
    InvariantViolation = 27,
    NotificationFailure = 28,
}

/// Expected business-rule failures. Reported to the caller with details, never retried.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    RoleForbidden {
        role: Role,
    },
    Banned {
        until: Option<DateTime<Utc>>,
        permanent: bool,
        days_remaining: Option<i64>,
    },
    ActiveLoanLimitReached {
        limit: i64,
    },
    UnpaidFeeOutstanding {
        #[schema(value_type = String)]
        total: Decimal,
    },
    ItemUnavailable {
        item_id: i64,
    },
    InvalidDueDate {
        message: String,
    },
    LoanNotFound {
        loan_id: i64,
    },
    AlreadyReturned {
        loan_id: i64,
        returned_at: Option<DateTime<Utc>>,
    },
    FeeNotOwed {
        loan_id: i64,
    },
    LoanStillActive {
        loan_id: i64,
    },
}

impl Rejection {
    fn status_and_code(&self) -> (StatusCode, ErrorCode) {
        match self {
            Rejection::RoleForbidden { .. } => (StatusCode::FORBIDDEN, ErrorCode::NotBorrowable),
            Rejection::Banned { .. } => (StatusCode::FORBIDDEN, ErrorCode::UserBanned),
            Rejection::ActiveLoanLimitReached { .. } => {
                (StatusCode::CONFLICT, ErrorCode::MaxBorrowsReached)
            }
            Rejection::UnpaidFeeOutstanding { .. } => {
                (StatusCode::PAYMENT_REQUIRED, ErrorCode::UnpaidFees)
            }
            Rejection::ItemUnavailable { .. } => (StatusCode::CONFLICT, ErrorCode::ItemNotAvailable),
            Rejection::InvalidDueDate { .. } => (StatusCode::BAD_REQUEST, ErrorCode::BadValue),
            Rejection::LoanNotFound { .. } => (StatusCode::NOT_FOUND, ErrorCode::NoSuchData),
            Rejection::AlreadyReturned { .. } => (StatusCode::CONFLICT, ErrorCode::AlreadyReturned),
            Rejection::FeeNotOwed { .. } => (StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::FeeNotOwed),
            Rejection::LoanStillActive { .. } => (StatusCode::CONFLICT, ErrorCode::LoanStillActive),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::RoleForbidden { role } => write!(f, "Accounts with role {} may not borrow", role),
            Rejection::Banned { permanent: true, .. } => write!(f, "Borrowing is permanently suspended"),
            Rejection::Banned { until, days_remaining, .. } => match (until, days_remaining) {
                (Some(until), Some(days)) => write!(
                    f,
                    "Borrowing suspended until {} ({} day(s) remaining)",
                    until.format("%Y-%m-%d"),
                    days
                ),
                _ => write!(f, "Borrowing is suspended"),
            },
            Rejection::ActiveLoanLimitReached { limit } => {
                write!(f, "Maximum active loans reached ({})", limit)
            }
            Rejection::UnpaidFeeOutstanding { total } => {
                write!(f, "Unpaid late fees outstanding: {}", total)
            }
            Rejection::ItemUnavailable { item_id } => write!(f, "Item {} is not available", item_id),
            Rejection::InvalidDueDate { message } => write!(f, "Invalid due date: {}", message),
            Rejection::LoanNotFound { loan_id } => write!(f, "Loan {} not found", loan_id),
            Rejection::AlreadyReturned { loan_id, .. } => {
                write!(f, "Loan {} was already returned", loan_id)
            }
            Rejection::FeeNotOwed { loan_id } => write!(f, "Loan {} has no fee to settle", loan_id),
            Rejection::LoanStillActive { loan_id } => {
                write!(f, "Loan {} must be returned before its fee can be settled", loan_id)
            }
        }
    }
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rejected: {0}")]
    Rejected(Rejection),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        AppError::Rejected(rejection)
    }
}

impl AppError {
    /// Infrastructure failures a caller may retry as-is
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Notification(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            AppError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
    /// Structured rejection details, present for business-rule failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Rejection>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            AppError::Authentication(msg) => {
                (StatusCode::UNAUTHORIZED, ErrorCode::NotAuthorized, msg, None)
            }
            AppError::Authorization(msg) => {
                (StatusCode::FORBIDDEN, ErrorCode::NotAuthorized, msg, None)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorCode::NoSuchData, msg, None),
            AppError::Validation(msg) | AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg, None)
            }
            AppError::Rejected(rejection) => {
                let (status, code) = rejection.status_and_code();
                (status, code, rejection.to_string(), Some(rejection))
            }
            AppError::InvariantViolation(msg) => {
                tracing::error!("Invariant violation: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InvariantViolation,
                    "Internal server error".to_string(),
                    None,
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorCode::DbFailure,
                    "Service temporarily unavailable, please retry".to_string(),
                    None,
                )
            }
            AppError::Notification(msg) => {
                tracing::error!("Notification error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::NotificationFailure,
                    "Internal server error".to_string(),
                    None,
                )
            }
            AppError::Config(msg) | AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
