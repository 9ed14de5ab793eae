//! In-process [`Store`] with the same version semantics as the SQLite store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::model::{Attempt, Exercise, Module, ModuleSummary, Session};
use crate::store::Store;

/// Store that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    modules: RwLock<HashMap<String, Module>>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert_module(&self, module: &Module) -> StoreResult<()> {
        let mut modules = self.modules.write().await;
        if modules.contains_key(&module.id) {
            return Err(StoreError::InvalidData(format!(
                "module '{}' already exists",
                module.id
            )));
        }
        modules.insert(module.id.clone(), module.clone());
        Ok(())
    }

    async fn get_module(&self, id: &str) -> StoreResult<Module> {
        self.modules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("module", id))
    }

    async fn list_modules(&self) -> StoreResult<Vec<ModuleSummary>> {
        let modules = self.modules.read().await;
        let mut summaries: Vec<ModuleSummary> = modules.values().map(Module::summary).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn store_exercises(
        &self,
        module_id: &str,
        expected_version: u64,
        exercises: &[Exercise],
    ) -> StoreResult<u64> {
        let mut modules = self.modules.write().await;
        let module = modules
            .get_mut(module_id)
            .ok_or_else(|| StoreError::not_found("module", module_id))?;
        if module.version != expected_version {
            return Err(StoreError::conflict("module", module_id, expected_version));
        }
        module.exercises = exercises.to_vec();
        module.version += 1;
        Ok(module.version)
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        if !self.modules.read().await.contains_key(&session.module_id) {
            return Err(StoreError::not_found("module", &session.module_id));
        }
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::InvalidData(format!(
                "session '{}' already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    async fn store_attempts(
        &self,
        session_id: &str,
        expected_version: u64,
        attempts: &[Attempt],
    ) -> StoreResult<u64> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        if session.version != expected_version {
            return Err(StoreError::conflict("session", session_id, expected_version));
        }
        session.attempts = attempts.to_vec();
        session.version += 1;
        Ok(session.version)
    }

    async fn update_session_state(&self, update: &Session) -> StoreResult<u64> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&update.id)
            .ok_or_else(|| StoreError::not_found("session", &update.id))?;
        if session.version != update.version {
            return Err(StoreError::conflict("session", &update.id, update.version));
        }
        session.current_exercise_index = update.current_exercise_index;
        session.status = update.status;
        session.confidence_rating = update.confidence_rating;
        session.completed_at = update.completed_at;
        session.version += 1;
        Ok(session.version)
    }
}
