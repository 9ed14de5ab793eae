//! Error types for LLM provider calls.
//!
//! The variants mirror the failure surface the retry policy needs to tell
//! apart: rate limiting (with an optional provider hint), timeouts, transport
//! failures, HTTP status errors, and failures that can never succeed on retry.

use std::time::Duration;

/// A specialized `Result` type for LLM provider operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur while calling an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    // ========================================================================
    // Transient failures
    // ========================================================================
    /// The provider answered HTTP 429.
    #[error("Rate limited by LLM provider{}: {message}", format_retry_after(*.retry_after))]
    RateLimited {
        /// Provider-supplied wait before the next attempt, if any.
        retry_after: Option<Duration>,
        /// Response body returned with the 429.
        message: String,
    },

    /// The request did not complete within its timeout.
    #[error("LLM request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure (DNS, refused connection, reset).
    #[error("LLM transport error: {0}")]
    Transport(String),

    // ========================================================================
    // Provider responses
    // ========================================================================
    /// Any non-success HTTP status other than 429.
    #[error("LLM API error (status {status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or provider error message.
        message: String,
    },

    /// The response body could not be decoded into the expected shape.
    #[error("Malformed LLM response: {0}")]
    Decode(String),

    /// The event stream failed after it had started.
    #[error("LLM stream error: {0}")]
    Stream(String),

    // ========================================================================
    // Local failures
    // ========================================================================
    /// The client could not be constructed or the request could not be built.
    #[error("LLM client configuration error: {0}")]
    Config(String),

    /// The caller abandoned the request.
    #[error("LLM request cancelled")]
    Cancelled,
}

fn format_retry_after(retry_after: Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| {
        format!(" (retry after {}s)", d.as_secs_f64())
    })
}

impl LlmError {
    /// Creates a `Status` error from a status code and message.
    #[must_use]
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Returns the HTTP status code associated with this error, if any.
    #[must_use]
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for authentication or authorization failures.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if err.is_builder() {
            Self::Config(err.to_string())
        } else if let Some(status) = err.status() {
            Self::status(status.as_u16(), err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
