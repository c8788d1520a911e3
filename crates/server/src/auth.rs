use axum::{
    http::{header, HeaderMap, StatusCode},
    Json,
};
use server_api::auth::{authenticate, AuthError};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};
use storage::StoredUser;
use tracing::{error, warn};

use crate::app_state::AppState;

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Resolves the caller of an HTTP route from its `Authorization: Bearer` header.
pub(crate) async fn require_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<StoredUser, (StatusCode, Json<ApiError>)> {
    let token = bearer_token(headers).ok_or_else(|| rejection(&AuthError::MissingCredential))?;
    authenticate(&state.api.storage, &state.jwt_secret, token, None)
        .await
        .map_err(|err| rejection(&err))
}

pub(crate) async fn require_identity(
    state: &AppState,
    token: &str,
    user_id: UserId,
) -> Result<StoredUser, (StatusCode, Json<ApiError>)> {
    authenticate(&state.api.storage, &state.jwt_secret, token, Some(user_id))
        .await
        .map_err(|err| rejection(&err))
}

pub(crate) fn rejection(err: &AuthError) -> (StatusCode, Json<ApiError>) {
    match err {
        AuthError::Lookup(message) => {
            error!(%message, "credential lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, "credential lookup failed")),
            )
        }
        other => {
            warn!(error = %other, "request rejected");
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(ErrorCode::Unauthorized, other.to_string())),
            )
        }
    }
}
