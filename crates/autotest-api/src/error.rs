//! Error types for the HTTP front end.

use autotest_core::AutotestError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Too many requests")]
    RateLimited,

    #[error("{0}")]
    NotFound(String),

    /// Request was understood but its content is not acceptable
    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Core(#[from] AutotestError),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::Unprocessable(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Core(err) => match err {
                AutotestError::AuthError(_) => StatusCode::UNAUTHORIZED,
                AutotestError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
                AutotestError::NotFound(_) => StatusCode::NOT_FOUND,
                AutotestError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "message": self.to_string() }))).into_response()
    }
}

/// Replace every occurrence of `api_key` in `message`.
pub fn redact(message: &str, api_key: Option<&str>) -> String {
    match api_key {
        Some(key) if !key.is_empty() => message.replace(key, "[REDACTED]"),
        _ => message.to_string(),
    }
}
