//! Scripted provider and record builders shared by the unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use drill_llm::{CompletionRequest, LlmError, LlmProvider, StreamEvent, TextStream};
use drill_store::{
    Assessment, Attempt, Exercise, ExerciseType, MemoryStore, Module, ModuleSummary, Session,
    SkillLevel, Store, StoreResult,
};

pub const GREAT_JOB: &str =
    r#"{"assessment":"strong","internal_score":85,"feedback":"Great job!"}"#;

pub const DEVELOPING: &str =
    r#"{"assessment":"developing","internal_score":60,"feedback":"Closer."}"#;

type Scripted<T> = Mutex<VecDeque<drill_llm::Result<T>>>;

/// Provider that replays queued responses in order.
#[derive(Default)]
pub struct ScriptedProvider {
    completions: Scripted<String>,
    streams: Scripted<Vec<drill_llm::Result<StreamEvent>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, response: drill_llm::Result<String>) {
        self.completions.lock().unwrap().push_back(response);
    }

    /// Queues a stream that yields each chunk as a text delta, then `Done`.
    pub fn push_stream(&self, chunks: &[&str]) {
        let mut events: Vec<_> = chunks
            .iter()
            .map(|chunk| Ok(StreamEvent::TextDelta((*chunk).to_string())))
            .collect();
        events.push(Ok(StreamEvent::Done));
        self.push_stream_events(events);
    }

    pub fn push_stream_events(&self, events: Vec<drill_llm::Result<StreamEvent>>) {
        self.streams.lock().unwrap().push_back(Ok(events));
    }

    pub fn push_stream_error(&self, err: LlmError) {
        self.streams.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, request: &CompletionRequest) {
        self.requests.lock().unwrap().push(request.clone());
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> drill_llm::Result<String> {
        self.record(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Config("no scripted completion left".into())))
    }

    async fn stream(&self, request: &CompletionRequest) -> drill_llm::Result<TextStream> {
        self.record(request);
        let events = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Config("no scripted stream left".into())))?;
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

pub fn sample_module(exercises: usize) -> Module {
    let exercises = (1..=exercises)
        .map(|n| Exercise {
            sequence: u32::try_from(n).unwrap(),
            exercise_type: ExerciseType::Analysis,
            name: Some(format!("Step {n}")),
            prompt: format!("Why do prices rise in scenario {n}?"),
            material: Some("Demand doubled while supply stayed flat.".to_string()),
            options: None,
            scaffold: None,
            hints: Vec::new(),
            validation_criteria: serde_json::json!({"must_mention": ["demand", "supply"]}),
            model_answer: "Demand outpaced supply.".to_string(),
            model_explanation: "Scarcity raises the clearing price.".to_string(),
            estimated_minutes: Some(5),
        })
        .collect();
    Module::new(
        "Price Signals",
        "economics",
        SkillLevel::Beginner,
        "author-1",
        exercises,
    )
}

pub fn attempt(exercise_index: usize, attempt_number: u32, hints_used: u32) -> Attempt {
    Attempt {
        exercise_index,
        attempt_number,
        answer_text: "Supply could not keep up.".to_string(),
        time_spent_seconds: 30,
        hints_used,
        assessment: Assessment::Developing,
        internal_score: 60,
        feedback: "Closer.".to_string(),
        should_advance: false,
        created_at: Utc::now(),
    }
}

/// Memory store that lets another writer win the next write once.
///
/// When armed, the next `store_attempts` first appends an attempt of its own,
/// and the next `store_exercises` first stores `"stored hint"` for every
/// missing level, so the caller's write hits a version conflict.
#[derive(Default)]
pub struct InterferingStore {
    pub inner: MemoryStore,
    pub race_attempts: AtomicBool,
    pub race_hints: AtomicBool,
}

#[async_trait]
impl Store for InterferingStore {
    async fn init(&self) -> StoreResult<()> {
        self.inner.init().await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn insert_module(&self, module: &Module) -> StoreResult<()> {
        self.inner.insert_module(module).await
    }

    async fn get_module(&self, id: &str) -> StoreResult<Module> {
        self.inner.get_module(id).await
    }

    async fn list_modules(&self) -> StoreResult<Vec<ModuleSummary>> {
        self.inner.list_modules().await
    }

    async fn store_exercises(
        &self,
        module_id: &str,
        expected_version: u64,
        exercises: &[Exercise],
    ) -> StoreResult<u64> {
        if self.race_hints.swap(false, Ordering::SeqCst) {
            let current = self.inner.get_module(module_id).await?;
            let mut theirs = current.exercises.clone();
            for (exercise, ours) in theirs.iter_mut().zip(exercises) {
                while exercise.hints.len() < ours.hints.len() {
                    exercise.hints.push("stored hint".to_string());
                }
            }
            self.inner
                .store_exercises(module_id, current.version, &theirs)
                .await?;
        }
        self.inner
            .store_exercises(module_id, expected_version, exercises)
            .await
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.inner.insert_session(session).await
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.inner.get_session(id).await
    }

    async fn store_attempts(
        &self,
        session_id: &str,
        expected_version: u64,
        attempts: &[Attempt],
    ) -> StoreResult<u64> {
        if self.race_attempts.swap(false, Ordering::SeqCst) {
            let current = self.inner.get_session(session_id).await?;
            let mut theirs = current.attempts.clone();
            let index = attempts.last().map_or(0, |a| a.exercise_index);
            let number = u32::try_from(current.attempts_for(index).count()).unwrap() + 1;
            theirs.push(attempt(index, number, 0));
            self.inner
                .store_attempts(session_id, current.version, &theirs)
                .await?;
        }
        self.inner
            .store_attempts(session_id, expected_version, attempts)
            .await
    }

    async fn update_session_state(&self, session: &Session) -> StoreResult<u64> {
        self.inner.update_session_state(session).await
    }
}
