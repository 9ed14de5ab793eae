//! Domain records for learning modules and practice sessions.
//!
//! A [`Module`] owns an ordered list of [`Exercise`]s. A [`Session`] tracks one
//! learner working through a module and accumulates [`Attempt`]s. Both
//! documents carry a `version` counter that every write bumps, so concurrent
//! read-modify-write cycles can detect each other.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of reasoning an exercise asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseType {
    /// Analyse a single piece of material.
    Analysis,
    /// Compare two or more approaches.
    Comparative,
    /// Apply a framework to a scenario.
    Framework,
}

impl fmt::Display for ExerciseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analysis => write!(f, "analysis"),
            Self::Comparative => write!(f, "comparative"),
            Self::Framework => write!(f, "framework"),
        }
    }
}

/// Target audience of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillLevel {
    /// New to the domain.
    Beginner,
    /// Some working knowledge.
    Intermediate,
    /// Practitioner.
    Advanced,
}

impl SkillLevel {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            _ => None,
        }
    }
}

impl fmt::Display for SkillLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session.
///
/// `InProgress -> Completed`, one way, and only through an explicit update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The learner is still working.
    #[default]
    InProgress,
    /// The session is closed to further attempts and hints.
    Completed,
}

impl SessionStatus {
    /// Returns `true` if no further mutation of attempts or hints is allowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use drill_store::SessionStatus;
    ///
    /// assert!(SessionStatus::Completed.is_terminal());
    /// assert!(!SessionStatus::InProgress.is_terminal());
    /// ```
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative grade of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    /// Meets all criteria (score about 80-100).
    Strong,
    /// Partially meets criteria (score about 50-79).
    Developing,
    /// Does not meet criteria (score about 0-49).
    NeedsSupport,
}

impl Assessment {
    /// Parses the wire form used by the evaluator.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strong" => Some(Self::Strong),
            "developing" => Some(Self::Developing),
            "needs_support" => Some(Self::NeedsSupport),
            _ => None,
        }
    }

    /// Score band this assessment is expected to fall in.
    #[must_use]
    pub const fn expected_band(&self) -> (u8, u8) {
        match self {
            Self::Strong => (80, 100),
            Self::Developing => (50, 79),
            Self::NeedsSupport => (0, 49),
        }
    }

    /// Returns `true` if `score` lies within [`Self::expected_band`].
    #[must_use]
    pub const fn matches_score(&self, score: u8) -> bool {
        let (low, high) = self.expected_band();
        score >= low && score <= high
    }
}

impl fmt::Display for Assessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Developing => write!(f, "developing"),
            Self::NeedsSupport => write!(f, "needs_support"),
        }
    }
}

// ============================================================================
// Module and Exercise
// ============================================================================

/// One exercise inside a module.
///
/// Everything except `hints` is fixed at import time. `hints` grows lazily,
/// one level at a time, as learners request them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    /// 1-based position within the module.
    pub sequence: u32,

    /// Kind of exercise.
    #[serde(rename = "type")]
    pub exercise_type: ExerciseType,

    /// Short title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The question posed to the learner.
    pub prompt: String,

    /// Reading material the prompt refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,

    /// Options to compare (comparative exercises).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,

    /// Structure the learner should fill in (framework exercises).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaffold: Option<serde_json::Value>,

    /// Hints generated so far, in level order.
    #[serde(default)]
    pub hints: Vec<String>,

    /// Criteria the evaluator checks answers against.
    #[serde(default)]
    pub validation_criteria: serde_json::Value,

    /// Reference answer.
    #[serde(default)]
    pub model_answer: String,

    /// Why the reference answer works.
    #[serde(default)]
    pub model_explanation: String,

    /// Expected time to complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

/// A learning module and its exercises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Unique identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Subject area.
    pub domain: String,
    /// Intended audience.
    pub skill_level: SkillLevel,
    /// Identifier of the owning user.
    pub owner: String,
    /// Exercises in order.
    pub exercises: Vec<Exercise>,
    /// Write counter for the exercises document.
    #[serde(default)]
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Module {
    /// Creates a module with a fresh identifier.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        domain: impl Into<String>,
        skill_level: SkillLevel,
        owner: impl Into<String>,
        exercises: Vec<Exercise>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            domain: domain.into(),
            skill_level,
            owner: owner.into(),
            exercises,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Returns the exercise at `index`, if any.
    #[must_use]
    pub fn exercise(&self, index: usize) -> Option<&Exercise> {
        self.exercises.get(index)
    }

    /// Returns the listing view of this module.
    #[must_use]
    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            domain: self.domain.clone(),
            skill_level: self.skill_level,
            exercise_count: self.exercises.len(),
            created_at: self.created_at,
        }
    }
}

/// Listing view of a module without its exercises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    /// Unique identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Subject area.
    pub domain: String,
    /// Intended audience.
    pub skill_level: SkillLevel,
    /// Number of exercises.
    pub exercise_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Session and Attempt
// ============================================================================

/// One evaluated answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// Exercise this attempt answers.
    pub exercise_index: usize,
    /// 1-based count within `exercise_index`.
    pub attempt_number: u32,
    /// The learner's answer.
    pub answer_text: String,
    /// Seconds the learner spent.
    pub time_spent_seconds: u32,
    /// Hints revealed before answering.
    pub hints_used: u32,
    /// Evaluator grade.
    pub assessment: Assessment,
    /// Evaluator score, 0-100.
    pub internal_score: u8,
    /// Evaluator feedback.
    pub feedback: String,
    /// Whether the learner was told to move on.
    #[serde(default)]
    pub should_advance: bool,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

/// A learner's progress through one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier.
    pub id: String,
    /// Identifier of the learner.
    pub owner: String,
    /// Module being practised.
    pub module_id: String,
    /// Exercise the learner is on.
    pub current_exercise_index: usize,
    /// Full attempt history, oldest first.
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Self-reported confidence, 1-5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_rating: Option<u8>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session was completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Write counter, bumped by every successful update.
    #[serde(default)]
    pub version: u64,
}

impl Session {
    /// Starts a new session at the first exercise.
    #[must_use]
    pub fn new(owner: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            module_id: module_id.into(),
            current_exercise_index: 0,
            attempts: Vec::new(),
            status: SessionStatus::InProgress,
            confidence_rating: None,
            started_at: Utc::now(),
            completed_at: None,
            version: 0,
        }
    }

    /// Returns `true` if the session is completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Iterates the attempts made on one exercise, oldest first.
    pub fn attempts_for(&self, exercise_index: usize) -> impl Iterator<Item = &Attempt> {
        self.attempts
            .iter()
            .filter(move |a| a.exercise_index == exercise_index)
    }
}
