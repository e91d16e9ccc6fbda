//! Public key directory.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{json_body, non_empty};
use crate::auth::AuthUser;
use crate::server::{ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UploadKeyRequest {
    pub public_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UsernameQuery {
    pub username: Option<String>,
}

/// POST /upload_key
#[instrument(skip(state, payload), fields(user_id = user.id))]
pub async fn upload_key_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UploadKeyRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = json_body(payload)?;
    let public_key =
        non_empty(request.public_key).ok_or_else(|| ApiError::bad_request("Missing public_key"))?;

    state.keys.upload(user.id, &public_key).await?;
    debug!("Public key stored");
    Ok(Json(json!({ "message": "Public key uploaded successfully." })))
}

/// GET /get_key?username=
pub async fn get_key_handler(
    _user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<Value>, ApiError> {
    let username = non_empty(query.username)
        .ok_or_else(|| ApiError::bad_request("Missing username query parameter."))?;

    let public_key = state
        .keys
        .by_username(&username)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found or has no public key."))?;

    Ok(Json(json!({
        "username": username,
        "public_key": public_key,
    })))
}

#[cfg(test)]
mod tests {
    use crate::server::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_upload_and_fetch_key() {
        let state = test_state().await;
        let alice = signed_up(&state, "alice").await;
        let bob = signed_up(&state, "bob").await;

        let (status, json) = send(
            &state,
            "POST",
            "/upload_key",
            Some(&alice),
            Some(r#"{"public_key": "-----BEGIN PUBLIC KEY-----"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Public key uploaded successfully.");

        let (status, json) = send(&state, "GET", "/get_key?username=alice", Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["username"], "alice");
        assert_eq!(json["public_key"], "-----BEGIN PUBLIC KEY-----");
    }

    #[tokio::test]
    async fn test_get_key_errors() {
        let state = test_state().await;
        let alice = signed_up(&state, "alice").await;

        let (status, json) = send(&state, "GET", "/get_key", Some(&alice), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "Missing username query parameter.");

        let (status, json) = send(&state, "GET", "/get_key?username=alice", Some(&alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["message"], "User not found or has no public key.");

        let (status, _) =
            send(&state, "POST", "/upload_key", Some(&alice), Some(r#"{"public_key": ""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_key_routes_require_token() {
        let state = test_state().await;

        let (status, json) = send(&state, "GET", "/get_key?username=alice", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["message"], "Token is missing!");

        let (status, json) =
            send(&state, "GET", "/get_key?username=alice", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["message"], "Token is invalid!");
    }
}
