//! Error types for Turnstile.

use thiserror::Error;

/// HTTP-equivalent status for a rejected admission check.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// HTTP-equivalent status for a request the pipeline could not decode.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// HTTP-equivalent status used for anything without a status of its own.
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client exhausted its token bucket
    #[error("rate exceeded")]
    RateExceeded,

    /// An error raised by a handler that carries its own status
    #[error("{message}")]
    Status {
        /// HTTP-equivalent status code
        status: u16,
        /// Human readable message
        message: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request payloads
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),
}

impl TurnstileError {
    /// Build an error carrying an explicit status.
    pub fn status_error(status: u16, message: impl Into<String>) -> Self {
        TurnstileError::Status {
            status,
            message: message.into(),
        }
    }

    /// The HTTP-equivalent status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            TurnstileError::RateExceeded => STATUS_TOO_MANY_REQUESTS,
            TurnstileError::Status { status, .. } => *status,
            TurnstileError::Json(_) => STATUS_BAD_REQUEST,
            TurnstileError::Config(_) | TurnstileError::Io(_) => STATUS_INTERNAL_ERROR,
        }
    }

    /// Whether this error is a rate-limit rejection.
    pub fn is_rate_exceeded(&self) -> bool {
        matches!(self, TurnstileError::RateExceeded)
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
