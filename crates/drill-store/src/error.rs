//! Error types for persistence operations.

use std::time::Duration;

/// A specialized `Result` type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while reading or writing records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{entity} not found: '{id}'")]
    NotFound {
        /// Record kind ("module", "session").
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A versioned write lost the race against another writer.
    #[error("{entity} '{id}' was modified concurrently (expected version {expected})")]
    VersionConflict {
        /// Record kind.
        entity: &'static str,
        /// Record identifier.
        id: String,
        /// Version the writer read before modifying.
        expected: u64,
    },

    /// No pooled connection became available in time.
    #[error("Timed out after {}ms waiting for a database connection", .waited.as_millis())]
    PoolTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// A statement ran past its deadline and was interrupted.
    #[error("Database statement cancelled after {}ms", .timeout.as_millis())]
    StatementTimeout {
        /// The statement deadline.
        timeout: Duration,
    },

    /// SQLite reported an error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while opening the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking database task failed to complete.
    #[error("Database task failed: {0}")]
    Task(String),

    /// A stored value could not be interpreted.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates a `VersionConflict` error.
    #[must_use]
    pub fn conflict(entity: &'static str, id: impl Into<String>, expected: u64) -> Self {
        Self::VersionConflict {
            entity,
            id: id.into(),
            expected,
        }
    }

    /// Returns `true` for pool and statement timeouts.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout { .. } | Self::StatementTimeout { .. }
        )
    }

    /// Returns `true` if the error is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
