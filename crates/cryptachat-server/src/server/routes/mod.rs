// Route modules for the Cryptachat HTTP API
pub mod auth; // Registration and login
pub mod contacts; // Chat requests and contact lists
pub mod keys; // Public key directory
pub mod messages; // Message log
pub mod websocket; // Real-time push channel

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    routing::{get, post},
    Json, Router,
};

use super::{ApiError, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(auth::register_handler))
        .route("/login", post(auth::login_handler))
        .route("/upload_key", post(keys::upload_key_handler))
        .route("/get_key", get(keys::get_key_handler))
        .route("/request_chat", post(contacts::request_chat_handler))
        .route("/get_chat_requests", get(contacts::get_chat_requests_handler))
        .route("/accept_chat", post(contacts::accept_chat_handler))
        .route("/get_contacts", get(contacts::get_contacts_handler))
        .route("/send_message", post(messages::send_message_handler))
        .route("/get_messages", get(messages::get_messages_handler))
        .route("/ws", get(websocket::ws_handler))
}

/// Unwrap a JSON body, turning any rejection into a plain 400.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|_| ApiError::bad_request("Invalid JSON body"))
}

/// Treat empty strings like absent fields.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
