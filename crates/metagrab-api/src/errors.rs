use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// API error surface with HTTP status mapping.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Input validation errors (400 Bad Request).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Unknown resource (404 Not Found).
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Engine is saturated or a dependency is down (503).
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Anything else (500).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal {
            message: err.to_string(),
        }
    }
}
