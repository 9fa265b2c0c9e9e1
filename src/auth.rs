//! Bearer-token authentication.
//!
//! Tokens are signed JWTs carrying only the user id and expiry; the user
//! record (role, company, supervisor) is loaded fresh on every request so
//! role changes and company suspension take effect immediately. Token
//! issuance lives in the identity service, not here; this side only
//! verifies.

use crate::error::AppError;
use crate::models::{CompanyStatus, Role, UserRecord};
use crate::state::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Expiry, seconds since epoch.
    pub exp: u64,
}

pub fn encode_token(user_id: i64, secret: &str, ttl: chrono::Duration) -> Result<String, AppError> {
    let claims = Claims {
        sub: user_id,
        exp: (Utc::now() + ttl).timestamp().max(0) as u64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Fatal(format!("token encode: {e}")))
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::Auth(format!("invalid token: {e}")))
}

/// Verify a raw token and load its user, enforcing company suspension.
pub async fn authenticate(state: &AppState, token: &str) -> Result<UserRecord, AppError> {
    let claims = decode_token(token, &state.config.jwt_secret)?;
    let user = state
        .store
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| AppError::Auth("unknown user".into()))?;

    if user.role != Role::SuperAdmin {
        let company = state.store.users.find_company(user.company_id).await?;
        if company.is_some_and(|c| c.status == CompanyStatus::Disabled) {
            return Err(AppError::Authz("company is disabled".into()));
        }
    }
    Ok(user)
}

fn bearer_from_parts(parts: &Parts) -> Result<String, AppError> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Auth("missing Authorization header".into()))?;
    header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| AppError::Auth("expected a bearer token".into()))
}

/// The authenticated caller, extracted per request.
pub struct CurrentUser(pub UserRecord);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let token = bearer_from_parts(parts)?;
        let user = authenticate(state, &token).await?;
        Ok(CurrentUser(user))
    }
}

/// A caller holding a supervisory role.
pub struct AdminUser(pub UserRecord);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        match user.role {
            Role::GroupAdmin | Role::Management | Role::SuperAdmin => Ok(AdminUser(user)),
            Role::Employee => Err(AppError::Authz("supervisor role required".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_token_round_trip() {
        let token = encode_token(42, SECRET, chrono::Duration::hours(1)).unwrap();
        let claims = decode_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, 42);
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = encode_token(42, SECRET, chrono::Duration::hours(-2)).unwrap();
        let err = decode_token(&token, SECRET).unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = encode_token(42, SECRET, chrono::Duration::hours(1)).unwrap();
        let err = decode_token(&token, "other-secret").unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(matches!(
            decode_token("not.a.jwt", SECRET).unwrap_err(),
            AppError::Auth(_)
        ));
    }
}
