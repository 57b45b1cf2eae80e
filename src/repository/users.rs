//! Users repository (ban-relevant projection only)

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{error::AppResult, models::user::Borrower};

#[derive(Clone)]
pub struct UsersRepository {
    pool: Pool<Postgres>,
}

impl UsersRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get the borrower projection of a user
    pub async fn find_borrower(&self, id: i64) -> AppResult<Option<Borrower>> {
        let borrower = sqlx::query_as::<_, Borrower>(
            r#"
            SELECT id, username, email, role, ban_until, is_permanent_ban
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(borrower)
    }

    /// Set `ban_until` only if it still holds the value the caller computed from
    pub async fn replace_ban(
        &self,
        id: i64,
        expected: Option<DateTime<Utc>>,
        ban_until: DateTime<Utc>,
    ) -> AppResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE users SET ban_until = $3
            WHERE id = $1 AND ban_until IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(ban_until)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}
