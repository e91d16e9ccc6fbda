//! Sending and polling encrypted messages.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Json,
};
use cryptachat_relay::NewMessage;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{json_body, non_empty};
use crate::auth::AuthUser;
use crate::server::{ApiError, AppState, Route};
use crate::store::StoreError;

/// Body of `POST /send_message`. Each blob is the same message encrypted
/// for one of the two participants.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SendMessageRequest {
    pub recipient_username: Option<String>,
    pub sender_blob: Option<String>,
    pub recipient_blob: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HistoryQuery {
    pub username: Option<String>,
    pub since_id: Option<String>,
}

/// POST /send_message
///
/// Appends to the log first; the push to an online recipient follows and
/// never affects the response.
#[instrument(skip(state, payload), fields(user_id = user.id))]
pub async fn send_message_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.limits.check(Route::SendMessage, user.id.to_string())?;
    let request = json_body(payload)?;
    let (Some(recipient_username), Some(sender_blob), Some(recipient_blob)) = (
        non_empty(request.recipient_username),
        non_empty(request.sender_blob),
        non_empty(request.recipient_blob),
    ) else {
        return Err(ApiError::bad_request(
            "Missing recipient_username, sender_blob, or recipient_blob",
        ));
    };

    let recipient = state
        .users
        .find_by_username(&recipient_username)
        .await?
        .ok_or_else(|| ApiError::not_found("Recipient user not found."))?;

    let stored = state
        .gateway
        .send(NewMessage {
            sender_id: user.id,
            sender_username: user.username,
            recipient_id: recipient.id,
            sender_blob,
            recipient_blob,
        })
        .await?;
    info!(message_id = stored.id, recipient_id = recipient.id, "Message sent");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Message sent successfully.",
            "id": stored.id,
            "timestamp": stored.timestamp,
        })),
    ))
}

/// GET /get_messages?username=&since_id=
pub async fn get_messages_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let partner_username = non_empty(query.username)
        .ok_or_else(|| ApiError::bad_request("Missing username query parameter."))?;
    let since_id = match non_empty(query.since_id) {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            ApiError::bad_request("Invalid since_id parameter, must be an integer.")
        })?,
        None => 0,
    };

    let partner_id = state
        .users
        .id_of(&partner_username)
        .await
        .map_err(|e| match e {
            StoreError::UserNotFound => ApiError::not_found("Partner user not found."),
            other => other.into(),
        })?;

    let messages = state.gateway.history(user.id, partner_id, since_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[cfg(test)]
mod tests {
    use crate::server::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_send_and_poll() {
        let state = test_state().await;
        let alice = signed_up(&state, "alice").await;
        let bob = signed_up(&state, "bob").await;

        let body = r#"{"recipient_username": "bob", "sender_blob": "for-alice", "recipient_blob": "for-bob"}"#;
        let (status, json) = send(&state, "POST", "/send_message", Some(&alice), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["message"], "Message sent successfully.");
        let first_id = json["id"].as_i64().unwrap();
        assert!(json["timestamp"].is_string());

        let (status, json) =
            send(&state, "GET", "/get_messages?username=alice", Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["encrypted_blob"], "for-bob");
        assert_eq!(messages[0]["sender_username"], "alice");

        let (_, json) = send(&state, "GET", "/get_messages?username=bob", Some(&alice), None).await;
        assert_eq!(json["messages"][0]["encrypted_blob"], "for-alice");

        let uri = format!("/get_messages?username=alice&since_id={first_id}");
        let (_, json) = send(&state, "GET", &uri, Some(&bob), None).await;
        assert!(json["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let state = test_state().await;
        let alice = signed_up(&state, "alice").await;

        let (status, json) = send(
            &state,
            "POST",
            "/send_message",
            Some(&alice),
            Some(r#"{"recipient_username": "bob", "sender_blob": "x"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "Missing recipient_username, sender_blob, or recipient_blob");

        let (status, json) = send(
            &state,
            "POST",
            "/send_message",
            Some(&alice),
            Some(r#"{"recipient_username": "bob", "sender_blob": "x", "recipient_blob": "y"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["message"], "Recipient user not found.");
    }

    #[tokio::test]
    async fn test_get_messages_validation() {
        let state = test_state().await;
        let alice = signed_up(&state, "alice").await;

        let cases = [
            ("/get_messages", StatusCode::BAD_REQUEST, "Missing username query parameter."),
            (
                "/get_messages?username=bob&since_id=abc",
                StatusCode::BAD_REQUEST,
                "Invalid since_id parameter, must be an integer.",
            ),
            ("/get_messages?username=bob", StatusCode::NOT_FOUND, "Partner user not found."),
        ];
        for (uri, expected_status, expected_message) in cases {
            let (status, json) = send(&state, "GET", uri, Some(&alice), None).await;
            assert_eq!(status, expected_status, "{uri}");
            assert_eq!(json["message"], expected_message);
        }
    }

    #[tokio::test]
    async fn test_send_message_rate_limited_per_user() {
        let mut config = crate::config::ServerConfig::with_secret("test-secret");
        config.rate_limits.send_message_per_hour = 1;
        let state = test_state_with(config).await;
        let alice = signed_up(&state, "alice").await;
        let carol = signed_up(&state, "carol").await;
        signed_up(&state, "bob").await;

        let body = r#"{"recipient_username": "bob", "sender_blob": "a", "recipient_blob": "b"}"#;
        let (status, _) = send(&state, "POST", "/send_message", Some(&alice), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(&state, "POST", "/send_message", Some(&alice), Some(body)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let (status, _) = send(&state, "POST", "/send_message", Some(&carol), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }
}
