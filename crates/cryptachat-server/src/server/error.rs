use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use crate::auth::AuthError;
use crate::store::StoreError;

/// Error returned by route handlers, rendered as `{"message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests,
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg) => msg,
            ApiError::TooManyRequests => "Rate limit exceeded".to_string(),
            ApiError::Internal(detail) => {
                error!(error = %detail, "Request failed");
                "Internal server error".to_string()
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UsernameTaken => ApiError::Conflict("Username already exists.".to_string()),
            StoreError::UserNotFound => ApiError::not_found("User not found."),
            StoreError::SelfRequest => {
                ApiError::bad_request("Cannot send chat request to yourself.")
            }
            StoreError::DuplicateRequest => {
                ApiError::Conflict("Chat request already pending or accepted.".to_string())
            }
            StoreError::NoPendingRequest => {
                ApiError::not_found("No pending request found from that user.")
            }
            StoreError::Corrupt(_) | StoreError::Database(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Crypto(_) => ApiError::Internal(err.to_string()),
            _ => ApiError::Unauthorized(err.to_string()),
        }
    }
}
