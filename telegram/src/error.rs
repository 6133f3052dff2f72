//! Error types for the Telegram Bot API client

use relay_core::transport::{DeliveryError, TransportError};
use thiserror::Error;

/// Errors that can occur when calling the Bot API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelegramError {
    /// HTTP request failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Response body could not be parsed
    #[error("Response parsing failed: {0}")]
    ResponseParseFailed(String),

    /// Flood control; Telegram says how long to wait
    #[error("Rate limited (retry after {retry_after:?}s)")]
    RateLimited {
        /// Seconds to wait, if given
        retry_after: Option<u64>,
    },

    /// The bot was blocked or may not write to the chat
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The chat does not exist
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// Any other API error
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// `description` from the API
        message: String,
    },
}

impl From<TelegramError> for DeliveryError {
    fn from(error: TelegramError) -> Self {
        match error {
            TelegramError::RequestFailed(reason) | TelegramError::ResponseParseFailed(reason) => {
                Self::Transport(reason)
            }
            TelegramError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            TelegramError::Forbidden(message) => Self::Forbidden(message),
            TelegramError::ChatNotFound(message) => Self::ChatNotFound(message),
            TelegramError::ApiError { status, message } => Self::Api { status, message },
        }
    }
}

impl From<TelegramError> for TransportError {
    fn from(error: TelegramError) -> Self {
        match error {
            TelegramError::RequestFailed(reason) => Self::Polling(reason),
            TelegramError::ResponseParseFailed(reason) => Self::InvalidResponse(reason),
            TelegramError::RateLimited { retry_after } => Self::Api {
                status: 429,
                message: format!("Too many requests (retry after {retry_after:?}s)"),
            },
            TelegramError::Forbidden(message) => Self::Api { status: 403, message },
            TelegramError::ChatNotFound(message) => Self::Api { status: 400, message },
            TelegramError::ApiError { status, message } => Self::Api { status, message },
        }
    }
}
