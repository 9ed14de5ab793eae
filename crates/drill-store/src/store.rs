//! The persistence contract used by the progression service.
//!
//! Every write to a document is conditional on the caller's `expected_version`
//! matching the stored one. On success the store bumps the version and returns
//! the new value; on mismatch it returns [`StoreError::VersionConflict`] and
//! leaves the row untouched. Reads return owned records, so no connection
//! outlives a call.
//!
//! [`StoreError::VersionConflict`]: crate::StoreError::VersionConflict

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{Attempt, Exercise, Module, ModuleSummary, Session};
use crate::pool::PoolStats;

/// Storage backend for modules and sessions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates the schema if needed.
    async fn init(&self) -> StoreResult<()>;

    /// Round-trips to the backend to check connectivity.
    async fn ping(&self) -> StoreResult<()>;

    /// Inserts a new module.
    async fn insert_module(&self, module: &Module) -> StoreResult<()>;

    /// Loads a module with its exercises.
    async fn get_module(&self, id: &str) -> StoreResult<Module>;

    /// Lists all modules, newest first.
    async fn list_modules(&self) -> StoreResult<Vec<ModuleSummary>>;

    /// Replaces a module's exercises document.
    async fn store_exercises(
        &self,
        module_id: &str,
        expected_version: u64,
        exercises: &[Exercise],
    ) -> StoreResult<u64>;

    /// Inserts a new session.
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    /// Loads a session with its attempt history.
    async fn get_session(&self, id: &str) -> StoreResult<Session>;

    /// Replaces a session's attempt history.
    async fn store_attempts(
        &self,
        session_id: &str,
        expected_version: u64,
        attempts: &[Attempt],
    ) -> StoreResult<u64>;

    /// Writes a session's scalar state (exercise index, status, confidence,
    /// completion time), guarded by `session.version`.
    async fn update_session_state(&self, session: &Session) -> StoreResult<u64>;

    /// Connection pool usage, for backends that pool.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}
