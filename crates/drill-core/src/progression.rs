//! Session progression: attempts, hints and session lifecycle.
//!
//! A session is `in_progress` until it is explicitly completed; `completed`
//! is terminal. Every rule is checked before anything is written:
//!
//! - a completed session takes no attempts, hints or updates;
//! - the exercise index must exist in the module;
//! - the attempt number is `1 + attempts already made on that exercise`, and
//!   must not exceed the per-exercise cap when one is configured;
//! - hint levels run from 1 to `max_hints`.
//!
//! Attempt histories and hint lists are written back whole, guarded by the
//! record's version counter. A write that loses a race reloads the record,
//! re-checks the rules against the fresh copy and tries again, up to
//! `write_retries` times.

use std::sync::Arc;

use chrono::Utc;
use drill_store::{
    Assessment, Attempt, Module, ModuleSummary, PoolStats, Session, SessionStatus, SkillLevel,
    Store, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProgressionConfig;
use crate::decoder::Evaluation;
use crate::error::{DrillError, Result};
use crate::evaluation::Evaluator;
use crate::events::SubmissionEvent;

// ============================================================================
// Requests and results
// ============================================================================

/// Request body for creating a session.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSession {
    /// Module to practise.
    pub module_id: String,
    /// Learner identifier.
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_owner() -> String {
    "anonymous".to_string()
}

/// Request body for updating a session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    /// Move to this exercise.
    #[serde(default)]
    pub current_exercise_index: Option<usize>,
    /// Self-reported confidence, 1-5.
    #[serde(default)]
    pub confidence_rating: Option<u8>,
    /// New lifecycle status.
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

impl SessionUpdate {
    /// True when the request names no field to change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.current_exercise_index.is_none()
            && self.confidence_rating.is_none()
            && self.status.is_none()
    }
}

/// Request body for submitting an answer.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAnswer {
    /// Exercise answered; defaults to the session's current exercise.
    #[serde(default)]
    pub exercise_index: Option<usize>,
    /// The answer.
    pub answer_text: String,
    /// Seconds spent on the answer.
    #[serde(default)]
    pub time_spent_seconds: u32,
    /// Hints revealed before answering.
    #[serde(default)]
    pub hints_used: u32,
}

/// Result of an evaluated, stored submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionResult {
    /// Qualitative grade.
    pub assessment: Assessment,
    /// Score in `0..=100`.
    pub internal_score: u8,
    /// Feedback text.
    pub feedback: String,
    /// Number the attempt was stored under.
    pub attempt_number: u32,
    /// Whether another hint may still be requested.
    pub hint_available: bool,
    /// Whether the learner should move on.
    pub should_advance: bool,
    /// Whether the model answer may now be shown.
    pub model_answer_available: bool,
}

impl From<SubmissionResult> for SubmissionEvent {
    fn from(result: SubmissionResult) -> Self {
        Self::Complete {
            assessment: result.assessment,
            internal_score: result.internal_score,
            feedback: result.feedback,
            attempt_number: result.attempt_number,
            hint_available: result.hint_available,
            should_advance: result.should_advance,
            model_answer_available: result.model_answer_available,
        }
    }
}

/// Request body for a hint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HintRequest {
    /// Explicit level; defaults to the next unused level.
    #[serde(default)]
    pub hint_level: Option<u32>,
}

/// A hint and how many remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HintResult {
    /// Hint text.
    pub hint: String,
    /// Level of this hint.
    pub hint_level: u32,
    /// Levels above this one.
    pub hints_remaining: u32,
}

/// Request body for importing a module.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleImport {
    /// Display title.
    pub title: String,
    /// Subject area.
    pub domain: String,
    /// Intended audience.
    pub skill_level: SkillLevel,
    /// Owning user.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Exercises in order.
    pub exercises: Vec<drill_store::Exercise>,
}

/// A submission that passed every rule and is ready to be evaluated.
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    session: Session,
    module: Module,
    exercise_index: usize,
    attempt_number: u32,
    request: SubmitAnswer,
}

impl PendingSubmission {
    /// Session the answer belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Attempt number as of the rule check.
    #[must_use]
    pub const fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    /// Exercise being answered.
    #[must_use]
    pub const fn exercise_index(&self) -> usize {
        self.exercise_index
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Number the next attempt on `exercise_index` gets.
#[must_use]
pub fn next_attempt_number(session: &Session, exercise_index: usize) -> u32 {
    let prior = session.attempts_for(exercise_index).count();
    u32::try_from(prior).unwrap_or(u32::MAX).saturating_add(1)
}

/// Checks that an answer to `exercise_index` may be recorded.
///
/// Returns the attempt number it would be stored under.
pub fn check_submission(
    session: &Session,
    module: &Module,
    exercise_index: usize,
    max_attempts: Option<u32>,
) -> Result<u32> {
    if session.is_completed() {
        return Err(DrillError::SessionCompleted);
    }
    if exercise_index >= module.exercises.len() {
        return Err(DrillError::ExerciseOutOfRange {
            index: exercise_index,
            count: module.exercises.len(),
        });
    }
    let attempt_number = next_attempt_number(session, exercise_index);
    match max_attempts {
        Some(max) if attempt_number > max => Err(DrillError::AttemptLimitReached { max }),
        _ => Ok(attempt_number),
    }
}

/// Resolves the hint level for a request.
///
/// Without an explicit level, the next level is one above the most hints
/// used by any attempt on the exercise.
pub fn resolve_hint_level(
    session: &Session,
    exercise_index: usize,
    requested: Option<u32>,
    max_hints: u32,
) -> Result<u32> {
    match requested {
        Some(level) if (1..=max_hints).contains(&level) => Ok(level),
        Some(level) => Err(DrillError::InvalidHintLevel {
            level,
            max: max_hints,
        }),
        None => {
            let used = session
                .attempts_for(exercise_index)
                .map(|a| a.hints_used)
                .max()
                .unwrap_or(0);
            let level = used.saturating_add(1);
            if level > max_hints {
                Err(DrillError::HintsExhausted)
            } else {
                Ok(level)
            }
        }
    }
}

/// Whether the model answer may be shown after an attempt.
#[must_use]
pub const fn model_answer_available(
    attempt_number: u32,
    max_attempts: Option<u32>,
    should_advance: bool,
) -> bool {
    if should_advance {
        return true;
    }
    match max_attempts {
        Some(max) => attempt_number >= max,
        None => false,
    }
}

fn hint_slot(level: u32) -> usize {
    usize::try_from(level).unwrap_or(usize::MAX)
}

// ============================================================================
// Service
// ============================================================================

/// Applies progression rules on top of a store and an evaluator.
#[derive(Clone)]
pub struct Progression {
    store: Arc<dyn Store>,
    evaluator: Evaluator,
    config: ProgressionConfig,
}

impl std::fmt::Debug for Progression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progression")
            .field("evaluator", &self.evaluator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Progression {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, evaluator: Evaluator, config: ProgressionConfig) -> Self {
        Self {
            store,
            evaluator,
            config,
        }
    }

    /// Progression rules in effect.
    #[must_use]
    pub const fn config(&self) -> &ProgressionConfig {
        &self.config
    }

    /// Returns `true` if the store answers.
    pub async fn store_healthy(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Store health check failed");
                false
            }
        }
    }

    /// Connection pool usage, for stores that pool.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.store.pool_stats()
    }

    // ------------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------------

    /// Stores a module supplied by the caller.
    pub async fn import_module(&self, import: ModuleImport) -> Result<Module> {
        if import.title.trim().is_empty() {
            return Err(DrillError::invalid_input("title must not be empty"));
        }
        if import.exercises.is_empty() {
            return Err(DrillError::invalid_input("module needs at least one exercise"));
        }
        let max_hints = hint_slot(self.config.max_hints);
        if let Some(exercise) = import.exercises.iter().find(|e| e.hints.len() > max_hints) {
            return Err(DrillError::invalid_input(format!(
                "exercise {} has more than {} hints",
                exercise.sequence, self.config.max_hints
            )));
        }

        let module = Module::new(
            import.title,
            import.domain,
            import.skill_level,
            import.owner,
            import.exercises,
        );
        self.store.insert_module(&module).await?;
        info!(module_id = %module.id, exercises = module.exercises.len(), "Imported module");
        Ok(module)
    }

    /// Loads a module.
    pub async fn get_module(&self, id: &str) -> Result<Module> {
        Ok(self.store.get_module(id).await?)
    }

    /// Lists modules, newest first.
    pub async fn list_modules(&self) -> Result<Vec<ModuleSummary>> {
        Ok(self.store.list_modules().await?)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Starts a session on an existing module.
    pub async fn create_session(&self, request: NewSession) -> Result<Session> {
        let module = self.store.get_module(&request.module_id).await?;
        let session = Session::new(request.owner, module.id);
        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, module_id = %session.module_id, "Created session");
        Ok(session)
    }

    /// Loads a session.
    pub async fn get_session(&self, id: &str) -> Result<Session> {
        Ok(self.store.get_session(id).await?)
    }

    /// Applies an update to a session's position, rating or status.
    pub async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<Session> {
        if update.is_empty() {
            return Err(DrillError::invalid_input("No fields provided for update"));
        }
        if let Some(rating) = update.confidence_rating {
            if !(1..=5).contains(&rating) {
                return Err(DrillError::invalid_input(
                    "confidence_rating must be between 1 and 5",
                ));
            }
        }

        for _ in 0..=self.config.write_retries {
            let mut session = self.store.get_session(id).await?;
            if session.is_completed() {
                let target = update.status.unwrap_or(SessionStatus::Completed);
                return Err(DrillError::invalid_transition(session.status, target));
            }

            if let Some(index) = update.current_exercise_index {
                let count = self.store.get_module(&session.module_id).await?.exercises.len();
                if index > count {
                    return Err(DrillError::ExerciseOutOfRange { index, count });
                }
                session.current_exercise_index = index;
            }
            if let Some(rating) = update.confidence_rating {
                session.confidence_rating = Some(rating);
            }
            if update.status == Some(SessionStatus::Completed) {
                session.status = SessionStatus::Completed;
                session.completed_at = Some(Utc::now());
            }

            match self.store.update_session_state(&session).await {
                Ok(version) => {
                    session.version = version;
                    info!(session_id = %id, status = %session.status, "Updated session");
                    return Ok(session);
                }
                Err(err) if err.is_conflict() => {
                    debug!(session_id = %id, "Session changed during update; reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(session_id = %id, "Giving up on contended session update");
        Err(DrillError::ConcurrentModification {
            entity: "session",
            id: id.to_string(),
        })
    }

    // ------------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------------

    /// Validates a submission and checks every rule against the stored session.
    pub async fn begin_submission(
        &self,
        session_id: &str,
        request: SubmitAnswer,
    ) -> Result<PendingSubmission> {
        self.validate_answer(&request)?;
        let session = self.store.get_session(session_id).await?;
        if session.is_completed() {
            return Err(DrillError::SessionCompleted);
        }
        let module = self.store.get_module(&session.module_id).await?;
        let exercise_index = request
            .exercise_index
            .unwrap_or(session.current_exercise_index);
        let attempt_number = check_submission(
            &session,
            &module,
            exercise_index,
            self.config.max_attempts_per_exercise,
        )?;

        Ok(PendingSubmission {
            session,
            module,
            exercise_index,
            attempt_number,
            request,
        })
    }

    /// Evaluates and stores an answer.
    pub async fn submit(
        &self,
        session_id: &str,
        request: SubmitAnswer,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResult> {
        let pending = self.begin_submission(session_id, request).await?;
        info!(
            session_id,
            exercise_index = pending.exercise_index,
            attempt = pending.attempt_number,
            "Evaluating answer"
        );
        let evaluation = self
            .evaluator
            .evaluate(
                self.exercise(&pending)?,
                &pending.request.answer_text,
                pending.request.hints_used,
                self.config.max_hints,
                cancel,
            )
            .await?;
        self.record_attempt(pending, evaluation, cancel).await
    }

    /// Evaluates and stores an answer, streaming progress to `events`.
    ///
    /// Sends `Start`, one `Content` per feedback character, and `Complete`
    /// once the attempt is stored. On error nothing is stored and no
    /// `Complete` is sent; reporting the error is left to the caller.
    pub async fn submit_streaming(
        &self,
        pending: PendingSubmission,
        events: &UnboundedSender<SubmissionEvent>,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResult> {
        let hint_available = pending.request.hints_used < self.config.max_hints;
        // A closed receiver means the client left; the cancel token covers that.
        let _ = events.send(SubmissionEvent::Start {
            attempt_number: pending.attempt_number,
            hint_available,
        });
        info!(
            session_id = %pending.session.id,
            exercise_index = pending.exercise_index,
            attempt = pending.attempt_number,
            "Streaming answer evaluation"
        );

        let evaluation = self
            .evaluator
            .evaluate_streaming(
                self.exercise(&pending)?,
                &pending.request.answer_text,
                pending.request.hints_used,
                self.config.max_hints,
                cancel,
                |ch| {
                    let _ = events.send(SubmissionEvent::Content {
                        text: ch.to_string(),
                    });
                },
            )
            .await?;

        let result = self.record_attempt(pending, evaluation, cancel).await?;
        let _ = events.send(result.clone().into());
        Ok(result)
    }

    fn exercise<'a>(&self, pending: &'a PendingSubmission) -> Result<&'a drill_store::Exercise> {
        pending
            .module
            .exercise(pending.exercise_index)
            .ok_or(DrillError::ExerciseOutOfRange {
                index: pending.exercise_index,
                count: pending.module.exercises.len(),
            })
    }

    fn validate_answer(&self, request: &SubmitAnswer) -> Result<()> {
        let length = request.answer_text.chars().count();
        let (min, max) = (self.config.min_answer_length, self.config.max_answer_length);
        if request.answer_text.trim().is_empty() || !(min..=max).contains(&length) {
            return Err(DrillError::invalid_input(format!(
                "answer_text must be between {min} and {max} characters"
            )));
        }
        if request.hints_used > self.config.max_hints {
            return Err(DrillError::invalid_input(format!(
                "hints_used must be between 0 and {}",
                self.config.max_hints
            )));
        }
        Ok(())
    }

    /// Appends the attempt with a version-guarded write, re-checking the
    /// rules against a fresh session after every lost race.
    async fn record_attempt(
        &self,
        pending: PendingSubmission,
        evaluation: Evaluation,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResult> {
        let PendingSubmission {
            mut session,
            module,
            exercise_index,
            request,
            ..
        } = pending;
        let cap = self.config.max_attempts_per_exercise;
        let should_advance =
            self.config.report_should_advance && evaluation.assessment == Assessment::Strong;

        for _ in 0..=self.config.write_retries {
            if cancel.is_cancelled() {
                debug!(session_id = %session.id, "Submission cancelled before it was stored");
                return Err(DrillError::Cancelled);
            }
            let attempt_number = check_submission(&session, &module, exercise_index, cap)?;

            let mut attempts = session.attempts.clone();
            attempts.push(Attempt {
                exercise_index,
                attempt_number,
                answer_text: request.answer_text.clone(),
                time_spent_seconds: request.time_spent_seconds,
                hints_used: request.hints_used,
                assessment: evaluation.assessment,
                internal_score: evaluation.internal_score,
                feedback: evaluation.feedback.clone(),
                should_advance,
                created_at: Utc::now(),
            });

            match self
                .store
                .store_attempts(&session.id, session.version, &attempts)
                .await
            {
                Ok(_) => {
                    info!(
                        session_id = %session.id,
                        exercise_index,
                        attempt = attempt_number,
                        assessment = %evaluation.assessment,
                        internal_score = evaluation.internal_score,
                        "Recorded attempt"
                    );
                    return Ok(SubmissionResult {
                        assessment: evaluation.assessment,
                        internal_score: evaluation.internal_score,
                        feedback: evaluation.feedback,
                        attempt_number,
                        hint_available: request.hints_used < self.config.max_hints,
                        should_advance,
                        model_answer_available: model_answer_available(
                            attempt_number,
                            cap,
                            should_advance,
                        ),
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(session_id = %session.id, "Attempt history changed; reloading");
                    session = self.store.get_session(&session.id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(session_id = %session.id, "Giving up on contended attempt write");
        Err(DrillError::ConcurrentModification {
            entity: "session",
            id: session.id,
        })
    }

    // ------------------------------------------------------------------------
    // Hints
    // ------------------------------------------------------------------------

    /// Returns the hint for the session's current exercise.
    ///
    /// Missing levels are generated in order and cached on the module, so
    /// every session on the module shares them.
    pub async fn request_hint(
        &self,
        session_id: &str,
        request: HintRequest,
        cancel: &CancellationToken,
    ) -> Result<HintResult> {
        let session = self.store.get_session(session_id).await?;
        if session.is_completed() {
            return Err(DrillError::SessionCompleted);
        }
        let module = self.store.get_module(&session.module_id).await?;
        let index = session.current_exercise_index;
        if index >= module.exercises.len() {
            return Err(DrillError::ExerciseOutOfRange {
                index,
                count: module.exercises.len(),
            });
        }

        let max_hints = self.config.max_hints;
        let level = resolve_hint_level(&session, index, request.hint_level, max_hints)?;
        let hint = self.ensure_hint(module, index, level, cancel).await?;
        info!(session_id, exercise_index = index, level, "Served hint");

        Ok(HintResult {
            hint,
            hint_level: level,
            hints_remaining: max_hints - level,
        })
    }

    /// Returns the stored hint for `level`, generating and storing any
    /// missing levels first. Text already stored always wins.
    async fn ensure_hint(
        &self,
        mut module: Module,
        index: usize,
        level: u32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let wanted = hint_slot(level);
        let mut generated: Vec<String> = Vec::new();

        for _ in 0..=self.config.write_retries {
            let exercise = module
                .exercise(index)
                .ok_or(DrillError::ExerciseOutOfRange {
                    index,
                    count: module.exercises.len(),
                })?
                .clone();
            if let Some(hint) = exercise.hints.get(wanted - 1) {
                return Ok(hint.clone());
            }

            let mut hints = exercise.hints.clone();
            while hints.len() < wanted {
                let slot = hints.len();
                let text = if let Some(text) = generated.get(slot) {
                    text.clone()
                } else {
                    let next_level = u32::try_from(slot + 1).unwrap_or(u32::MAX);
                    self.evaluator
                        .generate_hint(&exercise, next_level, &hints, cancel)
                        .await?
                };
                hints.push(text);
            }
            generated.clone_from(&hints);

            let mut exercises = module.exercises.clone();
            exercises[index].hints = hints;
            match self
                .store
                .store_exercises(&module.id, module.version, &exercises)
                .await
            {
                Ok(_) => {
                    debug!(module_id = %module.id, exercise_index = index, level, "Stored hints");
                    return Ok(generated[wanted - 1].clone());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(module_id = %module.id, "Module changed while storing hints; reloading");
                    module = self.store.get_module(&module.id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(module_id = %module.id, "Giving up on contended hint write");
        Err(DrillError::ConcurrentModification {
            entity: "module",
            id: module.id,
        })
    }
}
