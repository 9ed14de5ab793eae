//! Drill persistence
//!
//! Modules, sessions and attempts, the [`Store`] contract used by the
//! progression service, and two implementations: a pooled SQLite store and an
//! in-memory store.

pub mod error;
pub mod memory;
pub mod model;
pub mod pool;
pub mod sqlite;
pub mod store;

#[cfg(test)]
mod test_support;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use model::{
    Assessment, Attempt, Exercise, ExerciseType, Module, ModuleSummary, Session, SessionStatus,
    SkillLevel,
};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use sqlite::SqliteStore;
pub use store::Store;
