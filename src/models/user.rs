//! User model (ban-relevant projection) and token claims

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, FromRow, Postgres};
use utoipa::ToSchema;

use crate::error::AppError;

/// Account role. Administrative accounts run the desk and may never borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "user")]
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "member" | "user" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

// SQLx conversion for Role (stored as TEXT)
impl sqlx::Type<Postgres> for Role {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> Decode<'r, Postgres> for Role {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s: String = Decode::<Postgres>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

impl Encode<'_, Postgres> for Role {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        <&str as Encode<Postgres>>::encode(self.as_str(), buf)
    }
}

/// The slice of a user account the lending rules care about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Borrower {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub ban_until: Option<DateTime<Utc>>,
    pub is_permanent_ban: bool,
}

impl Borrower {
    /// A borrower is banned while the permanent flag is set or `ban_until` lies ahead of `now`.
    pub fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.is_permanent_ban || self.ban_until.is_some_and(|until| until > now)
    }

    /// Whole days left on a temporary ban, rounded up. `None` when not temporarily banned.
    pub fn ban_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let until = self.ban_until.filter(|until| *until > now)?;
        let ms = (until - now).num_milliseconds();
        Some((ms + crate::services::policy::MS_PER_DAY - 1) / crate::services::policy::MS_PER_DAY)
    }
}

/// JWT claims issued by the session service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// User ID
    pub sub: i64,
    pub role: Role,
    pub exp: i64,
}

impl UserClaims {
    /// Create a signed token (used by tooling and tests; sessions are issued elsewhere)
    pub fn create_token(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{encode, EncodingKey, Header};
        encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }

    /// Parse JWT token
    pub fn from_token(token: &str, secret: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        let token_data = decode::<Self>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::Authorization("Administrator role required".to_string()))
        }
    }

    pub fn require_self_or_admin(&self, user_id: i64) -> Result<(), AppError> {
        if self.sub == user_id || self.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::Authorization("Access to another user's loans denied".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn borrower(ban_until: Option<DateTime<Utc>>, permanent: bool) -> Borrower {
        Borrower {
            id: 1,
            username: "ayse".to_string(),
            email: "ayse@example.org".to_string(),
            role: Role::Member,
            ban_until,
            is_permanent_ban: permanent,
        }
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!("USER".parse::<Role>(), Ok(Role::Member));
        assert!("librarian".parse::<Role>().is_err());
    }

    #[test]
    fn test_ban_state() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();

        assert!(!borrower(None, false).is_banned_at(now));
        assert!(!borrower(Some(now), false).is_banned_at(now));
        assert!(borrower(Some(now + Duration::seconds(1)), false).is_banned_at(now));
        assert!(borrower(None, true).is_banned_at(now));
    }

    #[test]
    fn test_ban_days_remaining_rounds_up() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let b = borrower(Some(now + Duration::hours(25)), false);
        assert_eq!(b.ban_days_remaining(now), Some(2));
        assert_eq!(borrower(Some(now - Duration::hours(1)), false).ban_days_remaining(now), None);
    }

    #[test]
    fn test_claims_round_trip_and_rights() {
        let claims = UserClaims { sub: 7, role: Role::Member, exp: 4_102_444_800 };
        let token = claims.create_token("secret").unwrap();
        let parsed = UserClaims::from_token(&token, "secret").unwrap();

        assert_eq!(parsed.sub, 7);
        assert!(parsed.require_admin().is_err());
        assert!(parsed.require_self_or_admin(7).is_ok());
        assert!(parsed.require_self_or_admin(8).is_err());
        assert!(UserClaims::from_token(&token, "other").is_err());
    }
}
