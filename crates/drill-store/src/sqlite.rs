//! SQLite-backed [`Store`].
//!
//! Each document keeps its JSON payload (exercises, attempts) in a single TEXT
//! column next to an integer `version`. Writes use
//! `UPDATE .. WHERE id = ? AND version = ?`, so a stale writer changes zero
//! rows and gets [`StoreError::VersionConflict`].
//!
//! Every call runs on the blocking pool with a statement deadline. A call that
//! overruns is interrupted through SQLite's interrupt handle and reported as
//! [`StoreError::StatementTimeout`].

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, InterruptHandle, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Attempt, Exercise, Module, ModuleSummary, Session, SessionStatus, SkillLevel,
};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::store::Store;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS modules (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    domain TEXT NOT NULL,
    skill_level TEXT NOT NULL,
    owner TEXT NOT NULL,
    exercises TEXT NOT NULL DEFAULT '[]',
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    module_id TEXT NOT NULL REFERENCES modules(id) ON DELETE CASCADE,
    current_exercise_index INTEGER NOT NULL DEFAULT 0,
    attempts TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'in_progress',
    confidence_rating INTEGER,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_module ON sessions(module_id);
CREATE INDEX IF NOT EXISTS idx_modules_created_at ON modules(created_at);
";

/// Store backed by a pooled SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
    statement_timeout: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// Does not create the schema; call [`Store::init`].
    pub async fn open(
        path: impl AsRef<Path>,
        pool_config: PoolConfig,
        statement_timeout: Duration,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let pool = tokio::task::spawn_blocking(move || ConnectionPool::open(path, pool_config))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(Self {
            pool,
            statement_timeout,
        })
    }

    /// Runs `func` on a pooled connection under the statement deadline.
    pub(crate) async fn with_connection<T, F>(&self, func: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let mut pooled = self.pool.acquire().await?;
        let guard = StatementInterrupt::new(pooled.interrupt_handle());
        let finisher = guard.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let result = pooled.connection().and_then(func);
            // Mark finished before the connection goes back to the pool.
            finisher.finish();
            drop(pooled);
            result
        });

        let timeout = self.statement_timeout;
        let Ok(joined) = tokio::time::timeout(timeout, &mut task).await else {
            if guard.interrupt() {
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Interrupted database statement past its deadline"
                );
            }
            // The statement may have finished just before the interrupt landed.
            return match task.await {
                Ok(Ok(value)) => Ok(value),
                _ => Err(StoreError::StatementTimeout { timeout }),
            };
        };

        joined
            .map_err(|e| StoreError::Task(e.to_string()))?
            .map_err(|e| interrupted_as_timeout(e, timeout))
    }
}

/// Interrupt handle that only fires while its call still owns the connection.
///
/// Once [`finish`](Self::finish) runs the connection may already belong to
/// another caller, so a late deadline must leave it alone.
#[derive(Clone)]
struct StatementInterrupt {
    handle: Option<Arc<InterruptHandle>>,
    finished: Arc<Mutex<bool>>,
}

impl StatementInterrupt {
    fn new(handle: Option<InterruptHandle>) -> Self {
        Self {
            handle: handle.map(Arc::new),
            finished: Arc::new(Mutex::new(false)),
        }
    }

    fn finish(&self) {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Interrupts the connection unless the call already finished.
    ///
    /// The lock is held across the interrupt so `finish` cannot slip in
    /// between the check and the call.
    fn interrupt(&self) -> bool {
        let finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        match &self.handle {
            Some(handle) if !*finished => {
                handle.interrupt();
                true
            }
            _ => false,
        }
    }
}

fn interrupted_as_timeout(err: StoreError, timeout: Duration) -> StoreError {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(ref failure, _))
            if failure.code == ErrorCode::OperationInterrupted =>
        {
            StoreError::StatementTimeout { timeout }
        }
        other => other,
    }
}

// ============================================================================
// Row conversion
// ============================================================================

fn to_i64(value: u64, what: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidData(format!("{what} out of range")))
}

fn to_u64(value: i64, what: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::InvalidData(format!("negative {what}")))
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{raw}': {e}")))
}

struct ModuleRow {
    id: String,
    title: String,
    domain: String,
    skill_level: String,
    owner: String,
    exercises: String,
    version: i64,
    created_at: String,
}

impl ModuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            domain: row.get(2)?,
            skill_level: row.get(3)?,
            owner: row.get(4)?,
            exercises: row.get(5)?,
            version: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<ModuleRow> for Module {
    type Error = StoreError;

    fn try_from(row: ModuleRow) -> StoreResult<Self> {
        let skill_level = SkillLevel::parse(&row.skill_level).ok_or_else(|| {
            StoreError::InvalidData(format!("unknown skill level '{}'", row.skill_level))
        })?;
        Ok(Self {
            exercises: serde_json::from_str(&row.exercises)?,
            version: to_u64(row.version, "module version")?,
            created_at: parse_timestamp(&row.created_at)?,
            id: row.id,
            title: row.title,
            domain: row.domain,
            skill_level,
            owner: row.owner,
        })
    }
}

struct SessionRow {
    id: String,
    owner: String,
    module_id: String,
    current_exercise_index: i64,
    attempts: String,
    status: String,
    confidence_rating: Option<i64>,
    started_at: String,
    completed_at: Option<String>,
    version: i64,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            module_id: row.get(2)?,
            current_exercise_index: row.get(3)?,
            attempts: row.get(4)?,
            status: row.get(5)?,
            confidence_rating: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            version: row.get(9)?,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> StoreResult<Self> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown status '{}'", row.status)))?;
        let current_exercise_index = usize::try_from(row.current_exercise_index)
            .map_err(|_| StoreError::InvalidData("negative exercise index".into()))?;
        let confidence_rating = row
            .confidence_rating
            .map(u8::try_from)
            .transpose()
            .map_err(|_| StoreError::InvalidData("confidence rating out of range".into()))?;
        Ok(Self {
            attempts: serde_json::from_str(&row.attempts)?,
            started_at: parse_timestamp(&row.started_at)?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            version: to_u64(row.version, "session version")?,
            id: row.id,
            owner: row.owner,
            module_id: row.module_id,
            current_exercise_index,
            status,
            confidence_rating,
        })
    }
}

/// Turns a zero-row conditional update into `NotFound` or `VersionConflict`.
fn check_versioned_update(
    connection: &Connection,
    table: &'static str,
    entity: &'static str,
    id: &str,
    changed: usize,
    expected: u64,
) -> StoreResult<u64> {
    if changed == 1 {
        return Ok(expected + 1);
    }
    let exists = connection
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        Err(StoreError::conflict(entity, id, expected))
    } else {
        Err(StoreError::not_found(entity, id))
    }
}

// ============================================================================
// Store implementation
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> StoreResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        debug!("SQLite schema ready");
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.with_connection(|connection| {
            connection.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn insert_module(&self, module: &Module) -> StoreResult<()> {
        let module = module.clone();
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO modules (id, title, domain, skill_level, owner, exercises, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    module.id,
                    module.title,
                    module.domain,
                    module.skill_level.as_str(),
                    module.owner,
                    serde_json::to_string(&module.exercises)?,
                    to_i64(module.version, "module version")?,
                    module.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_module(&self, id: &str) -> StoreResult<Module> {
        let id = id.to_string();
        self.with_connection(move |connection| {
            let row = connection
                .query_row(
                    "SELECT id, title, domain, skill_level, owner, exercises, version, created_at
                     FROM modules WHERE id = ?1",
                    [&id],
                    ModuleRow::from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("module", &id))?;
            Module::try_from(row)
        })
        .await
    }

    async fn list_modules(&self) -> StoreResult<Vec<ModuleSummary>> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare(
                "SELECT id, title, domain, skill_level, json_array_length(exercises), created_at
                 FROM modules ORDER BY created_at DESC",
            )?;
            let rows = statement.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, title, domain, skill_level, count, created_at) = row?;
                summaries.push(ModuleSummary {
                    skill_level: SkillLevel::parse(&skill_level).ok_or_else(|| {
                        StoreError::InvalidData(format!("unknown skill level '{skill_level}'"))
                    })?,
                    exercise_count: usize::try_from(count).unwrap_or(0),
                    created_at: parse_timestamp(&created_at)?,
                    id,
                    title,
                    domain,
                });
            }
            Ok(summaries)
        })
        .await
    }

    async fn store_exercises(
        &self,
        module_id: &str,
        expected_version: u64,
        exercises: &[Exercise],
    ) -> StoreResult<u64> {
        let id = module_id.to_string();
        let payload = serde_json::to_string(exercises)?;
        self.with_connection(move |connection| {
            let changed = connection.execute(
                "UPDATE modules SET exercises = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![payload, id, to_i64(expected_version, "module version")?],
            )?;
            check_versioned_update(connection, "modules", "module", &id, changed, expected_version)
        })
        .await
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let session = session.clone();
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO sessions (id, owner, module_id, current_exercise_index, attempts, status,
                                       confidence_rating, started_at, completed_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.id,
                    session.owner,
                    session.module_id,
                    to_i64(session.current_exercise_index as u64, "exercise index")?,
                    serde_json::to_string(&session.attempts)?,
                    session.status.as_str(),
                    session.confidence_rating,
                    session.started_at.to_rfc3339(),
                    session.completed_at.map(|t| t.to_rfc3339()),
                    to_i64(session.version, "session version")?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        let id = id.to_string();
        self.with_connection(move |connection| {
            let row = connection
                .query_row(
                    "SELECT id, owner, module_id, current_exercise_index, attempts, status,
                            confidence_rating, started_at, completed_at, version
                     FROM sessions WHERE id = ?1",
                    [&id],
                    SessionRow::from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("session", &id))?;
            Session::try_from(row)
        })
        .await
    }

    async fn store_attempts(
        &self,
        session_id: &str,
        expected_version: u64,
        attempts: &[Attempt],
    ) -> StoreResult<u64> {
        let id = session_id.to_string();
        let payload = serde_json::to_string(attempts)?;
        self.with_connection(move |connection| {
            let changed = connection.execute(
                "UPDATE sessions SET attempts = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![payload, id, to_i64(expected_version, "session version")?],
            )?;
            check_versioned_update(connection, "sessions", "session", &id, changed, expected_version)
        })
        .await
    }

    async fn update_session_state(&self, session: &Session) -> StoreResult<u64> {
        let session = session.clone();
        self.with_connection(move |connection| {
            let changed = connection.execute(
                "UPDATE sessions
                 SET current_exercise_index = ?1, status = ?2, confidence_rating = ?3,
                     completed_at = ?4, version = version + 1
                 WHERE id = ?5 AND version = ?6",
                params![
                    to_i64(session.current_exercise_index as u64, "exercise index")?,
                    session.status.as_str(),
                    session.confidence_rating,
                    session.completed_at.map(|t| t.to_rfc3339()),
                    session.id,
                    to_i64(session.version, "session version")?,
                ],
            )?;
            check_versioned_update(
                connection,
                "sessions",
                "session",
                &session.id,
                changed,
                session.version,
            )
        })
        .await
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.pool.stats())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    use super::*;
    use crate::test_support::{attempt, module_with, session_for};

    async fn open_store(dir: &TempDir, statement_timeout: Duration) -> SqliteStore {
        let store = SqliteStore::open(
            dir.path().join("drill.db"),
            PoolConfig::default(),
            statement_timeout,
        )
        .await
        .unwrap();
        store.init().await.unwrap();
        store
    }

    // ------------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_module_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;
        let module = module_with(2);

        assert_ok!(store.insert_module(&module).await);
        let loaded = store.get_module(&module.id).await.unwrap();

        assert_eq!(loaded.id, module.id);
        assert_eq!(loaded.exercises, module.exercises);
        assert_eq!(loaded.skill_level, SkillLevel::Beginner);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_missing_module_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;

        let err = store.get_module("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "module", .. }));
    }

    #[tokio::test]
    async fn test_list_modules_counts_exercises() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;
        store.insert_module(&module_with(3)).await.unwrap();

        let listed = store.list_modules().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].exercise_count, 3);
    }

    #[tokio::test]
    async fn test_store_exercises_checks_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;
        let mut module = module_with(1);
        store.insert_module(&module).await.unwrap();

        module.exercises[0].hints.push("Think about incentives".into());
        let version = store
            .store_exercises(&module.id, 0, &module.exercises)
            .await
            .unwrap();
        assert_eq!(version, 1);

        // A writer still holding version 0 loses.
        let err = store
            .store_exercises(&module.id, 0, &module.exercises)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let loaded = store.get_module(&module.id).await.unwrap();
        assert_eq!(loaded.exercises[0].hints, vec!["Think about incentives"]);
        assert_eq!(loaded.version, 1);
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_store_attempts_round_trip_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;
        let module = module_with(1);
        store.insert_module(&module).await.unwrap();
        let session = session_for(&module);
        store.insert_session(&session).await.unwrap();

        let attempts = vec![attempt(0, 1)];
        let version = store
            .store_attempts(&session.id, 0, &attempts)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let stale = store
            .store_attempts(&session.id, 0, &[attempt(0, 1), attempt(0, 2)])
            .await
            .unwrap_err();
        assert!(stale.is_conflict());

        let loaded = store.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.attempts, attempts);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_store_attempts_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;

        let err = store.store_attempts("ghost", 0, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "session", .. }));
    }

    #[tokio::test]
    async fn test_update_session_state_persists_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;
        let module = module_with(2);
        store.insert_module(&module).await.unwrap();
        let mut session = session_for(&module);
        store.insert_session(&session).await.unwrap();

        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        session.confidence_rating = Some(4);
        session.current_exercise_index = 1;
        let version = store.update_session_state(&session).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.confidence_rating, Some(4));
        assert_eq!(loaded.current_exercise_index, 1);
        assert!(loaded.completed_at.is_some());
    }

    // ------------------------------------------------------------------------
    // Timeouts and health
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_long_statement_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_millis(100)).await;

        let err = store
            .with_connection(|connection| {
                connection.query_row(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
                     SELECT count(*) FROM n",
                    [],
                    |row| row.get::<_, i64>(0),
                )?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(
            matches!(err, StoreError::StatementTimeout { .. }),
            "got {err:?}"
        );

        // The interrupted connection is still usable.
        assert_ok!(store.ping().await);
    }

    #[test]
    fn test_finished_call_does_not_interrupt_connection() {
        let connection = Connection::open_in_memory().unwrap();
        let guard = StatementInterrupt::new(Some(connection.get_interrupt_handle()));

        guard.finish();
        assert!(!guard.interrupt());

        // No interrupt reached the connection, so the next statement runs.
        let value: i64 = connection.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_running_call_is_interrupted() {
        let connection = Connection::open_in_memory().unwrap();
        let guard = StatementInterrupt::new(Some(connection.get_interrupt_handle()));

        assert!(guard.interrupt());
        assert!(!StatementInterrupt::new(None).interrupt());
    }

    #[tokio::test]
    async fn test_ping_and_pool_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Duration::from_secs(5)).await;

        assert_ok!(store.ping().await);
        let stats = store.pool_stats().unwrap();
        assert_eq!(stats.max_size, 10);
        assert!(stats.size >= 1);
        assert_eq!(stats.available, stats.size);
    }
}
