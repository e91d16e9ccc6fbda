//! Account registration and login.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{json_body, non_empty};
use crate::auth::{hash_password, verify_password, AuthError};
use crate::server::{ApiError, AppState, ClientIp, Route};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// POST /register
#[instrument(skip(state, payload))]
pub async fn register_handler(
    ClientIp(ip): ClientIp,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.limits.check(Route::Register, ip)?;
    let credentials = json_body(payload)?;
    let (Some(username), Some(password)) = (
        non_empty(credentials.username),
        non_empty(credentials.password),
    ) else {
        return Err(ApiError::bad_request("Missing username or password"));
    };

    let hash = blocking(move || hash_password(&password)).await?;
    let id = state.users.create(&username, &hash).await?;
    info!(user_id = id, username = %username, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "New user registered successfully!" })),
    ))
}

/// POST /login
#[instrument(skip(state, payload))]
pub async fn login_handler(
    ClientIp(ip): ClientIp,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    state.limits.check(Route::Login, ip)?;
    let credentials = json_body(payload)?;
    let (Some(username), Some(password)) = (
        non_empty(credentials.username),
        non_empty(credentials.password),
    ) else {
        return Err(ApiError::Unauthorized("Could not verify".to_string()));
    };

    let rejected = || ApiError::Unauthorized("Could not verify! Check username/password.".to_string());
    let user = state
        .users
        .find_by_username(&username)
        .await?
        .ok_or_else(rejected)?;

    let stored = user.password_hash.clone();
    if !blocking(move || verify_password(&password, &stored)).await? {
        return Err(rejected());
    }

    let token = state.tokens.issue(user.id, &user.username)?;
    info!(user_id = user.id, "User logged in");
    Ok(Json(json!({ "token": token })))
}

/// Run Argon2 work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("password task failed: {e}")))?
        .map_err(ApiError::from)
}
