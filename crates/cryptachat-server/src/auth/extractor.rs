//! Request extractors for authenticated routes.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use cryptachat_relay::UserId;
use serde::Deserialize;
use tracing::debug;

use super::AuthError;
use crate::server::{ApiError, AppState};

/// The caller of an authenticated route, re-loaded from the user table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    pub username: String,
}

/// Like [`AuthUser`], but also accepts `?token=` for clients that cannot
/// set headers on a WebSocket handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsAuthUser(pub AuthUser);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?.ok_or(AuthError::MissingToken)?;
        authenticate(state, &token).await
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for WsAuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(parts)? {
            Some(token) => token,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.token)
                .filter(|token| !token.is_empty())
                .ok_or(AuthError::MissingToken)?,
        };
        authenticate(state, &token).await.map(WsAuthUser)
    }
}

/// The token from an `Authorization: Bearer` header, if the header is present.
fn bearer_token(parts: &Parts) -> Result<Option<String>, AuthError> {
    let Some(value) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::MalformedToken)?;
    if value.is_empty() {
        return Ok(None);
    }
    value
        .strip_prefix("Bearer ")
        .map(|token| Some(token.to_string()))
        .ok_or(AuthError::MalformedToken)
}

async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, ApiError> {
    let claims = state.tokens.verify(token)?;
    match state.users.find_by_id(claims.user_id).await? {
        Some(user) => Ok(AuthUser {
            id: user.id,
            username: user.username,
        }),
        None => {
            debug!(user_id = claims.user_id, "Token for unknown user");
            Err(AuthError::InvalidToken.into())
        }
    }
}
