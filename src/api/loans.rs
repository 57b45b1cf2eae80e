//! Loan management endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::loan::{BorrowRequest, LoanDetails, ReturnOutcome},
    AppState,
};

use super::AuthenticatedUser;

/// Borrow request. The borrower is the authenticated user.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateLoanRequest {
    /// Item to borrow
    #[validate(range(min = 1, message = "Invalid item id"))]
    pub item_id: i64,
    /// Due date, RFC 3339 timestamp or `YYYY-MM-DD`
    pub due_date: Option<String>,
}

/// Settlement notification from the payment collaborator
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SettlementRequest {
    /// Payment reference
    #[validate(length(min = 1, max = 128, message = "Reference must be 1 to 128 characters"))]
    pub reference: String,
    /// When the payment was made; defaults to now
    pub settled_at: Option<DateTime<Utc>>,
}

/// Get loans for a specific user
#[utoipa::path(
    get,
    path = "/users/{id}/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID")
    ),
    responses(
        (status = 200, description = "User's loans, newest first", body = Vec<LoanDetails>),
        (status = 403, description = "Not allowed to read this user's loans"),
        (status = 404, description = "User not found")
    )
)]
pub async fn get_user_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<LoanDetails>>> {
    claims.require_self_or_admin(user_id)?;

    let now = state.services.clock.now();
    let loans = state.services.loans.user_loans(user_id, now).await?;
    Ok(Json(loans))
}

/// Create a new loan (borrow an item)
#[utoipa::path(
    post,
    path = "/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    request_body = CreateLoanRequest,
    responses(
        (status = 201, description = "Loan created", body = LoanDetails),
        (status = 400, description = "Invalid due date", body = crate::error::ErrorResponse),
        (status = 402, description = "Unpaid late fees outstanding", body = crate::error::ErrorResponse),
        (status = 403, description = "Borrower banned or not allowed to borrow", body = crate::error::ErrorResponse),
        (status = 409, description = "Item unavailable or loan limit reached", body = crate::error::ErrorResponse)
    )
)]
pub async fn create_loan(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<CreateLoanRequest>,
) -> AppResult<(StatusCode, Json<LoanDetails>)> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let borrow = BorrowRequest {
        user_id: claims.sub,
        item_id: request.item_id,
        due_date: request.due_date,
    };

    let now = state.services.clock.now();
    let loan = state.services.loans.try_borrow(&borrow, now).await?;

    Ok((StatusCode::CREATED, Json(LoanDetails::at(loan, now))))
}

/// Return a borrowed item
#[utoipa::path(
    post,
    path = "/loans/{id}/return",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Loan ID")
    ),
    responses(
        (status = 200, description = "Item returned", body = ReturnOutcome),
        (status = 404, description = "Loan not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Already returned", body = crate::error::ErrorResponse)
    )
)]
pub async fn return_loan(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(loan_id): Path<i64>,
) -> AppResult<Json<ReturnOutcome>> {
    let loan = state.services.loans.get_loan(loan_id).await?;
    claims.require_self_or_admin(loan.user_id)?;

    let outcome = state
        .services
        .loans
        .return_loan(loan_id, state.services.clock.now())
        .await?;
    Ok(Json(outcome))
}

/// Record settlement of a late fee
#[utoipa::path(
    post,
    path = "/loans/{id}/settlement",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Loan ID")
    ),
    request_body = SettlementRequest,
    responses(
        (status = 200, description = "Fee settled (or already settled)", body = LoanDetails),
        (status = 404, description = "Loan not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Loan not returned yet", body = crate::error::ErrorResponse),
        (status = 422, description = "No fee owed on this loan", body = crate::error::ErrorResponse)
    )
)]
pub async fn settle_fee(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(loan_id): Path<i64>,
    Json(request): Json<SettlementRequest>,
) -> AppResult<Json<LoanDetails>> {
    claims.require_admin()?;
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let now = state.services.clock.now();
    let loan = state
        .services
        .loans
        .settle_fee(loan_id, &request.reference, request.settled_at.unwrap_or(now))
        .await?;

    Ok(Json(LoanDetails::at(loan, now)))
}
