//! Maps provider failures onto stable, user-facing error kinds and messages.

use serde::Serialize;

use crate::errors::AppError;

/// Message used when an error carries no text of its own.
pub const FALLBACK_MESSAGE: &str = "Please check the back-end console";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller failed the shared-secret check
    Unauthenticated,
    /// Provider answered 401
    ProviderAuthFailed,
    /// Provider answered 403
    ProviderAccessRefused,
    /// Provider answered 500, 502, 503 or 504
    ProviderUnavailable,
    Timeout,
    InvalidRequest,
    RateLimited,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslatedError {
    pub kind: ErrorKind,
    pub message: String,
}

const STATUS_MESSAGES: &[(u16, ErrorKind, &str)] = &[
    (401, ErrorKind::ProviderAuthFailed, "[OpenAI] 提供错误的API密钥 | Incorrect API key provided"),
    (403, ErrorKind::ProviderAccessRefused, "[OpenAI] 服务器拒绝访问，请稍后再试 | Server refused to access, please try again later"),
    (500, ErrorKind::ProviderUnavailable, "[OpenAI] 服务器繁忙，请稍后再试 | Internal Server Error"),
    (502, ErrorKind::ProviderUnavailable, "[OpenAI] 错误的网关 | Bad Gateway"),
    (503, ErrorKind::ProviderUnavailable, "[OpenAI] 服务器繁忙，请稍后再试 | Server is busy, please try again later"),
    (504, ErrorKind::ProviderUnavailable, "[OpenAI] 网关超时 | Gateway Time-out"),
];

/// Looks up the fixed entry for a provider status code.
pub fn lookup_status(status: u16) -> Option<(ErrorKind, &'static str)> {
    STATUS_MESSAGES
        .iter()
        .find(|(code, _, _)| *code == status)
        .map(|(_, kind, message)| (*kind, *message))
}

/// Translate a raw error into its stable kind and message. Never fails.
pub fn translate(error: &AppError) -> TranslatedError {
    if let Some((kind, message)) = error.status_code().and_then(lookup_status) {
        return TranslatedError {
            kind,
            message: message.to_string(),
        };
    }

    let kind = match error {
        AppError::TimeoutError(_) => ErrorKind::Timeout,
        AppError::AuthenticationError(_) => ErrorKind::Unauthenticated,
        AppError::RateLimitError(_) => ErrorKind::RateLimited,
        AppError::BadRequest(_) => ErrorKind::InvalidRequest,
        _ => ErrorKind::Unknown,
    };

    let raw = error.raw_message().trim();
    let message = if raw.is_empty() { FALLBACK_MESSAGE } else { raw };

    TranslatedError {
        kind,
        message: message.to_string(),
    }
}
