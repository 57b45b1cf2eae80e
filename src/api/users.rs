//! User account cleanup endpoints

use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    error::AppResult,
    models::loan::{LoanPurge, PurgeReport},
    AppState,
};

use super::AuthenticatedUser;

/// Remove a user's loans before the account is deleted
#[utoipa::path(
    delete,
    path = "/users/{id}/loans",
    tag = "users",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID")
    ),
    responses(
        (status = 200, description = "Loans removed, held items available again", body = PurgeReport),
        (status = 403, description = "Administrator role required")
    )
)]
pub async fn purge_user_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<PurgeReport>> {
    claims.require_admin()?;

    let report = state.services.loans.purge(LoanPurge::Borrower(user_id)).await?;
    Ok(Json(report))
}
