//! Error types for the Drill service.
//!
//! This module defines the error hierarchy for configuration loading,
//! session progression rules, LLM evaluation and persistence. Provider and
//! store errors are folded into the variants the HTTP layer needs to tell
//! apart.

use std::path::PathBuf;
use std::time::Duration;

use drill_llm::LlmError;
use drill_store::StoreError;

/// A specialized `Result` type for Drill operations.
pub type Result<T> = std::result::Result<T, DrillError>;

/// Errors that can occur while serving exercises and sessions.
#[derive(Debug, thiserror::Error)]
pub enum DrillError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your drill.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// No session with the given id.
    #[error("Session not found: '{id}'")]
    SessionNotFound {
        /// The requested session id.
        id: String,
    },

    /// No module with the given id.
    #[error("Module not found: '{id}'")]
    ModuleNotFound {
        /// The requested module id.
        id: String,
    },

    // ========================================================================
    // Business Rule Errors
    // ========================================================================
    /// The session is completed and accepts no further changes.
    #[error("Session already completed")]
    SessionCompleted,

    /// The exercise index does not exist in the module.
    #[error("Exercise index {index} out of range (module has {count} exercises)")]
    ExerciseOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of exercises in the module.
        count: usize,
    },

    /// The per-exercise attempt cap was reached.
    #[error("Maximum attempts ({max}) reached for this exercise")]
    AttemptLimitReached {
        /// The configured cap.
        max: u32,
    },

    /// Every hint level for the exercise has been used.
    #[error("All hints used for this exercise")]
    HintsExhausted,

    /// An explicit hint level outside `1..=max`.
    #[error("Hint level {level} is invalid (must be between 1 and {max})")]
    InvalidHintLevel {
        /// The requested level.
        level: u32,
        /// The highest level available.
        max: u32,
    },

    /// A request field failed validation.
    #[error("Invalid request: {message}")]
    InvalidInput {
        /// What was wrong with the request.
        message: String,
    },

    // ========================================================================
    // State Machine Errors
    // ========================================================================
    /// Invalid state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// Optimistic writes kept losing to concurrent writers.
    #[error("{entity} '{id}' is being modified concurrently; retry the request")]
    ConcurrentModification {
        /// Record kind ("session", "module").
        entity: &'static str,
        /// Record identifier.
        id: String,
    },

    // ========================================================================
    // LLM Errors
    // ========================================================================
    /// The provider kept rate limiting after every retry.
    #[error("Evaluation service is rate limited; try again later")]
    RateLimited {
        /// Provider-supplied wait, if any.
        retry_after: Option<Duration>,
    },

    /// The provider did not answer in time after every retry.
    #[error("Evaluation service timed out")]
    LlmTimeout,

    /// The provider failed in a way that is not a timeout or rate limit.
    #[error("Evaluation service unavailable: {message}")]
    LlmUnavailable {
        /// Underlying provider error.
        message: String,
    },

    /// The provider answered with output that failed validation.
    #[error("Answer evaluation failed: {message}")]
    MalformedResponse {
        /// Why the output was rejected.
        message: String,
    },

    /// The caller went away before the operation finished.
    #[error("Request cancelled")]
    Cancelled,

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// No database connection became available in time.
    #[error("Database is busy; try again later")]
    DatabaseBusy {
        /// How long the request waited.
        waited: Duration,
    },

    /// A database statement exceeded its deadline.
    #[error("Database operation timed out")]
    DatabaseTimeout {
        /// The statement deadline.
        timeout: Duration,
    },

    /// Any other persistence failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl DrillError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `SessionNotFound` error.
    #[must_use]
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    /// Creates a new `ModuleNotFound` error.
    #[must_use]
    pub fn module_not_found(id: impl Into<String>) -> Self {
        Self::ModuleNotFound { id: id.into() }
    }

    /// Creates a new `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a new `MalformedResponse` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns `true` for rule violations detected before any mutation.
    #[must_use]
    pub const fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::SessionCompleted
                | Self::ExerciseOutOfRange { .. }
                | Self::AttemptLimitReached { .. }
                | Self::HintsExhausted
                | Self::InvalidHintLevel { .. }
                | Self::InvalidInput { .. }
        )
    }

    /// Returns `true` if the same request may succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::LlmTimeout
                | Self::ConcurrentModification { .. }
                | Self::DatabaseBusy { .. }
                | Self::DatabaseTimeout { .. }
        )
    }

    /// Returns the provider's retry hint for rate-limit errors.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// A short message that never includes internal details.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::MalformedResponse { .. } => "Answer evaluation failed".to_string(),
            Self::LlmUnavailable { .. } => "Evaluation service unavailable".to_string(),
            Self::Database(_) => "Database error".to_string(),
            Self::ConfigParseError { .. } | Self::ConfigValidationError { .. } => {
                "Server misconfigured".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<LlmError> for DrillError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { retry_after, .. } => Self::RateLimited { retry_after },
            LlmError::Timeout(_) => Self::LlmTimeout,
            LlmError::Cancelled => Self::Cancelled,
            LlmError::Decode(message) => Self::MalformedResponse { message },
            other @ (LlmError::Transport(_)
            | LlmError::Status { .. }
            | LlmError::Stream(_)
            | LlmError::Config(_)) => Self::LlmUnavailable {
                message: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for DrillError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                entity: "session",
                id,
            } => Self::SessionNotFound { id },
            StoreError::NotFound {
                entity: "module",
                id,
            } => Self::ModuleNotFound { id },
            StoreError::VersionConflict { entity, id, .. } => {
                Self::ConcurrentModification { entity, id }
            }
            StoreError::PoolTimeout { waited } => Self::DatabaseBusy { waited },
            StoreError::StatementTimeout { timeout } => Self::DatabaseTimeout { timeout },
            other => Self::Database(other.to_string()),
        }
    }
}
