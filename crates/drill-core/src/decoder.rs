//! Incremental extraction of the `feedback` field from a streamed evaluation.
//!
//! The evaluator streams a JSON object shaped like
//! `{"assessment": ..., "internal_score": ..., "feedback": "..."}`. While it
//! streams, [`FeedbackDecoder`] emits the characters of the `feedback` string
//! as they arrive. Those characters are cosmetic: the authoritative result is
//! produced by [`parse_evaluation`] once the whole response is in, and the
//! non-streaming path uses the same function.
//!
//! The scanner is a three-state automaton driven by the pure [`transition`]
//! function:
//!
//! - `Scanning` keeps a rolling buffer and waits for `"feedback"`, a colon and
//!   the opening quote of the value (whitespace around the colon is allowed);
//! - `InValue` emits each character until an unescaped `"` closes the field;
//!   a backslash moves to `Escaped` without being emitted;
//! - `Escaped` emits the next character as-is and returns to `InValue`.

use drill_store::Assessment;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::DrillError;

/// Characters kept while scanning for the field marker.
const BUFFER_LIMIT: usize = 32;

/// The quoted key the scanner looks for.
const FIELD_KEY: &str = "\"feedback\"";

// ============================================================================
// Automaton
// ============================================================================

/// Scanner state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanState {
    /// Looking for the field marker.
    #[default]
    Scanning,
    /// Inside the field value.
    InValue,
    /// Inside the field value, right after a backslash.
    Escaped,
}

/// Result of feeding one character to the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Next state.
    pub state: ScanState,
    /// Next rolling buffer.
    pub buffer: String,
    /// Character to forward to the client, if any.
    pub emitted: Option<char>,
    /// `true` when this character closed the field value.
    pub field_closed: bool,
}

/// Advances the scanner by one character.
#[must_use]
pub fn transition(state: ScanState, buffer: &str, ch: char) -> Transition {
    match state {
        ScanState::Scanning => {
            let mut buffer = buffer.to_string();
            buffer.push(ch);
            trim_front(&mut buffer);
            if ch == '"' && ends_with_marker(&buffer) {
                Transition {
                    state: ScanState::InValue,
                    buffer: String::new(),
                    emitted: None,
                    field_closed: false,
                }
            } else {
                Transition {
                    state: ScanState::Scanning,
                    buffer,
                    emitted: None,
                    field_closed: false,
                }
            }
        }
        ScanState::InValue => match ch {
            '\\' => Transition {
                state: ScanState::Escaped,
                buffer: String::new(),
                emitted: None,
                field_closed: false,
            },
            '"' => Transition {
                state: ScanState::Scanning,
                buffer: String::new(),
                emitted: None,
                field_closed: true,
            },
            _ => Transition {
                state: ScanState::InValue,
                buffer: String::new(),
                emitted: Some(ch),
                field_closed: false,
            },
        },
        ScanState::Escaped => Transition {
            state: ScanState::InValue,
            buffer: String::new(),
            emitted: Some(ch),
            field_closed: false,
        },
    }
}

/// Drops leading characters so at most `BUFFER_LIMIT` remain.
fn trim_front(buffer: &mut String) {
    let excess = buffer.chars().count().saturating_sub(BUFFER_LIMIT);
    if excess > 0 {
        let cut = buffer
            .char_indices()
            .nth(excess)
            .map_or(buffer.len(), |(index, _)| index);
        buffer.drain(..cut);
    }
}

/// Matches `"feedback"`, optional whitespace, `:`, optional whitespace, `"`.
fn ends_with_marker(buffer: &str) -> bool {
    buffer
        .strip_suffix('"')
        .map(str::trim_end)
        .and_then(|rest| rest.strip_suffix(':'))
        .map(str::trim_end)
        .is_some_and(|rest| rest.ends_with(FIELD_KEY))
}

// ============================================================================
// Decoder
// ============================================================================

/// Feeds streamed text through the scanner and keeps the raw response.
#[derive(Debug, Clone, Default)]
pub struct FeedbackDecoder {
    state: ScanState,
    buffer: String,
    raw: String,
    closed: bool,
}

impl FeedbackDecoder {
    /// Creates a decoder in the scanning state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a text chunk and returns the feedback characters it revealed.
    ///
    /// Once the field has closed, further text is only accumulated.
    pub fn push(&mut self, chunk: &str) -> Vec<char> {
        self.raw.push_str(chunk);
        let mut emitted = Vec::new();
        if self.closed {
            return emitted;
        }
        for ch in chunk.chars() {
            let next = transition(self.state, &self.buffer, ch);
            self.state = next.state;
            self.buffer = next.buffer;
            emitted.extend(next.emitted);
            if next.field_closed {
                self.closed = true;
                break;
            }
        }
        emitted
    }

    /// Returns `true` once the feedback value has been fully streamed.
    #[must_use]
    pub const fn field_closed(&self) -> bool {
        self.closed
    }

    /// Everything received so far.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parses and validates the complete response.
    pub fn finish(self) -> Result<Evaluation, EvaluationError> {
        parse_evaluation(&self.raw)
    }
}

// ============================================================================
// Complete result
// ============================================================================

/// A validated evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Qualitative grade.
    pub assessment: Assessment,
    /// Score in `0..=100`.
    pub internal_score: u8,
    /// Feedback for the learner.
    pub feedback: String,
}

/// Reasons an evaluator response is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    /// The text is not JSON.
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    /// The JSON is not an object.
    #[error("response is not a JSON object")]
    NotAnObject,

    /// A required field is absent or has the wrong type.
    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),

    /// `assessment` is not one of the allowed values.
    #[error("invalid assessment value '{0}'")]
    InvalidAssessment(String),

    /// `internal_score` is outside `0..=100` or not an integer.
    #[error("score must be an integer between 0 and 100, got {0}")]
    ScoreOutOfRange(String),
}

impl From<EvaluationError> for DrillError {
    fn from(err: EvaluationError) -> Self {
        Self::malformed(err.to_string())
    }
}

/// Parses and validates a complete evaluator response.
///
/// A response wrapped in a markdown code fence is unwrapped by taking the text
/// between the first `{` and the last `}`.
pub fn parse_evaluation(raw: &str) -> Result<Evaluation, EvaluationError> {
    let text = strip_code_fence(raw.trim());
    let value: Value =
        serde_json::from_str(text).map_err(|e| EvaluationError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(EvaluationError::NotAnObject)?;

    let assessment_text = object
        .get("assessment")
        .and_then(Value::as_str)
        .ok_or(EvaluationError::MissingField("assessment"))?;
    let assessment = Assessment::parse(assessment_text)
        .ok_or_else(|| EvaluationError::InvalidAssessment(assessment_text.to_string()))?;

    let score_value = object
        .get("internal_score")
        .filter(|v| v.is_number())
        .ok_or(EvaluationError::MissingField("internal_score"))?;
    let internal_score = score_value
        .as_u64()
        .or_else(|| whole_number(score_value.as_f64()?))
        .filter(|score| *score <= 100)
        .and_then(|score| u8::try_from(score).ok())
        .ok_or_else(|| EvaluationError::ScoreOutOfRange(score_value.to_string()))?;

    let feedback = object
        .get("feedback")
        .and_then(Value::as_str)
        .ok_or(EvaluationError::MissingField("feedback"))?
        .to_string();

    if !assessment.matches_score(internal_score) {
        warn!(
            %assessment,
            internal_score,
            "Evaluator score falls outside the assessment band"
        );
    }

    Ok(Evaluation {
        assessment,
        internal_score,
        feedback,
    })
}

/// Converts a float score such as `85.0` when it is whole and in range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_number(score: f64) -> Option<u64> {
    (score.is_finite() && score.fract() == 0.0 && (0.0..=100.0).contains(&score))
        .then(|| score as u64)
}

fn strip_code_fence(text: &str) -> &str {
    if !text.starts_with("```") {
        return text;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}
