//! Crate-wide error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::pty::PtyError;

/// Errors that can surface from an HTTP handler.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("session not found")]
    NotFound,

    #[error("pty error: {0}")]
    Pty(#[from] PtyError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatewayError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg }),
            ),
            GatewayError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "rate limited", "retryAfter": retry_after_secs }),
            ),
            GatewayError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({ "error": "session not found" }),
            ),
            GatewayError::Pty(PtyError::SpawnFailed(msg)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": msg }),
            ),
            GatewayError::Pty(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            ),
            GatewayError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": msg }),
            ),
        };

        if matches!(status, StatusCode::TOO_MANY_REQUESTS) {
            tracing::warn!(%self, "request denied");
        } else if status.is_server_error() {
            tracing::error!(%self, "request failed");
        }

        let mut response = (status, Json(body)).into_response();
        if let GatewayError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
