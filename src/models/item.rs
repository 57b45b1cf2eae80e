//! Item (book) availability projection

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// A lendable item as seen by the circulation desk. The catalog owns every other field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Item {
    pub id: i64,
    pub title: String,
    pub available: bool,
}
