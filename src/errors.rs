use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::envelope::ApiResponse;

// anyhow carries config-loading errors; everything past startup is an AppError

/// Failures raised by the relay, its providers and the HTTP layer
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Non-2xx answer from the provider or the reverse proxy
    #[error("Provider error: {message}")]
    ProviderError {
        status: u16,
        message: String,
    },

    /// Transport failure before any status code was received
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Stream error: {0}")]
    StreamingError(String),

    #[error("Unauthorized: {0}")]
    AuthenticationError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitError(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn provider_error(status: u16, message: impl Into<String>) -> Self {
        Self::ProviderError {
            status,
            message: message.into(),
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::TimeoutError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalServerError(msg.into())
    }

    /// HTTP status reported by the provider, when one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::ProviderError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The human-readable part of the error, without the variant prefix.
    pub fn raw_message(&self) -> &str {
        match self {
            AppError::BadRequest(msg)
            | AppError::NetworkError(msg)
            | AppError::TimeoutError(msg)
            | AppError::StreamingError(msg)
            | AppError::AuthenticationError(msg)
            | AppError::RateLimitError(msg)
            | AppError::InternalServerError(msg)
            | AppError::ConfigError(msg) => msg,
            AppError::ProviderError { message, .. } => message,
        }
    }
}

/// Convert AppError to HTTP response
///
/// Request-level failures answer 200 with the outcome in the envelope's `status`
/// field, which is what the web client reads. Only server faults use 5xx.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InternalServerError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::OK,
        };

        let body = match self {
            AppError::AuthenticationError(msg) => ApiResponse::<()>::unauthorized(msg),
            other => {
                let translated = crate::translator::translate(&other);
                ApiResponse::<()>::fail(translated.message)
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Startup failures surfaced through anyhow become configuration errors
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "Configuration failure");
        AppError::ConfigError(format!("{:#}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
