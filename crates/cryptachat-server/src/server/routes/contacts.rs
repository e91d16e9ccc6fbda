//! The chat request handshake.
//!
//! Both sides of the handshake push a frame to the other party when they
//! are online; the HTTP response never waits on that push.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use cryptachat_relay::OutboundFrame;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{json_body, non_empty};
use crate::auth::AuthUser;
use crate::server::{ApiError, AppState, Route};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatRequest {
    pub recipient_username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AcceptRequest {
    pub requester_username: Option<String>,
}

/// POST /request_chat
#[instrument(skip(state, payload), fields(user_id = user.id))]
pub async fn request_chat_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.limits.check(Route::RequestChat, user.id.to_string())?;
    let request = json_body(payload)?;
    let recipient_username = non_empty(request.recipient_username)
        .ok_or_else(|| ApiError::bad_request("Missing recipient_username"))?;

    let recipient = state
        .users
        .find_by_username(&recipient_username)
        .await?
        .ok_or_else(|| ApiError::not_found("Recipient user not found."))?;

    state.contacts.request(user.id, recipient.id).await?;
    info!(recipient_id = recipient.id, "Chat request sent");

    state.gateway.notify(
        recipient.id,
        OutboundFrame::ChatRequest {
            from_username: user.username.clone(),
        },
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": format!("Chat request sent to {}.", recipient.username) })),
    ))
}

/// GET /get_chat_requests
pub async fn get_chat_requests_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let pending = state.contacts.pending_for(user.id).await?;
    Ok(Json(json!({ "pending_requests": pending })))
}

/// POST /accept_chat
#[instrument(skip(state, payload), fields(user_id = user.id))]
pub async fn accept_chat_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AcceptRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    state.limits.check(Route::AcceptChat, user.id.to_string())?;
    let request = json_body(payload)?;
    let requester_username = non_empty(request.requester_username)
        .ok_or_else(|| ApiError::bad_request("Missing requester_username"))?;

    // An unknown requester can't have a pending request either.
    let requester = state
        .users
        .find_by_username(&requester_username)
        .await?
        .ok_or_else(|| ApiError::not_found("No pending request found from that user."))?;

    state.contacts.accept(user.id, requester.id).await?;
    info!(requester_id = requester.id, "Chat request accepted");

    state.gateway.notify(
        requester.id,
        OutboundFrame::ChatAccepted {
            by_username: user.username.clone(),
        },
    );

    Ok(Json(json!({
        "message": format!("Chat request from {} accepted!", requester.username)
    })))
}

/// GET /get_contacts
pub async fn get_contacts_handler(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let contacts = state.contacts.contacts_of(user.id).await?;
    Ok(Json(json!({ "contacts": contacts })))
}
