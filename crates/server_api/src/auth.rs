use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use storage::{Storage, StoredUser};
use thiserror::Error;

pub const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub uid: i64,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("credential is not an access token")]
    WrongTokenType,
    #[error("credential does not belong to user {0}")]
    IdentityMismatch(UserId),
    #[error("user {0} is unknown or inactive")]
    InactiveUser(UserId),
    #[error("credential lookup failed: {0}")]
    Lookup(String),
}

/// Issues an HS256 access token. Used by tests and the operator CLI.
pub fn mint_access_token(
    secret: &str,
    user_id: UserId,
    username: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = AccessClaims {
        sub: username.to_string(),
        uid: user_id.0,
        typ: ACCESS_TOKEN_TYPE.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn decode_access_token(secret: &str, token: &str) -> Result<AccessClaims, AuthError> {
    let data = decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    if data.claims.typ != ACCESS_TOKEN_TYPE {
        return Err(AuthError::WrongTokenType);
    }
    Ok(data.claims)
}

/// Validates `token` and resolves the active user it names.
///
/// With `expected` set, the token must belong to that identity.
pub async fn authenticate(
    storage: &Storage,
    secret: &str,
    token: &str,
    expected: Option<UserId>,
) -> Result<StoredUser, AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingCredential);
    }
    let claims = decode_access_token(secret, token)?;
    let user_id = UserId(claims.uid);
    if let Some(expected) = expected {
        if expected != user_id {
            return Err(AuthError::IdentityMismatch(expected));
        }
    }
    let user = storage
        .load_user(user_id)
        .await
        .map_err(|e| AuthError::Lookup(e.to_string()))?;
    match user {
        Some(user) if user.is_active => Ok(user),
        _ => Err(AuthError::InactiveUser(user_id)),
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
