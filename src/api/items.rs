//! Catalog item cleanup endpoints

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

/// Remove an item's loans before the item is deleted
#[utoipa::path(
    delete,
    path = "/items/{id}/loans",
    tag = "items",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Item ID")
    ),
    responses(
        (status = 200, description = "Loans removed", body = PurgeReport),
        (status = 403, description = "Administrator role required")
    )
)]
pub async fn purge_item_loans(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(item_id): Path<i64>,
) -> AppResult<Json<PurgeReport>> {
    claims.require_admin()?;

    let report = state.services.loans.purge(LoanPurge::Item(item_id)).await?;
    Ok(Json(report))
}
