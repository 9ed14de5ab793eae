//! Events sent to the client while a submission is evaluated.

use drill_store::Assessment;
use serde::Serialize;

/// One server-sent event of a streamed submission.
///
/// A successful stream is `Start`, any number of `Content`, then exactly one
/// `Complete`. A failed stream ends with `Error` instead of `Complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubmissionEvent {
    /// Evaluation has started.
    Start {
        /// Number the attempt will be stored under.
        attempt_number: u32,
        /// Whether another hint may still be requested.
        hint_available: bool,
    },
    /// A fragment of the feedback text.
    Content {
        /// The fragment.
        text: String,
    },
    /// The attempt was evaluated and stored.
    Complete {
        /// Qualitative grade.
        assessment: Assessment,
        /// Score in `0..=100`.
        internal_score: u8,
        /// Complete feedback text.
        feedback: String,
        /// Number the attempt was stored under.
        attempt_number: u32,
        /// Whether another hint may still be requested.
        hint_available: bool,
        /// Whether the learner should move to the next exercise.
        should_advance: bool,
        /// Whether the model answer may now be shown.
        model_answer_available: bool,
    },
    /// Evaluation failed; nothing was stored.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl SubmissionEvent {
    /// Returns `true` for `Complete` and `Error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Renders the event as the JSON payload of an SSE `data:` line.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"failed to encode event"}"#.to_string()
        })
    }
}
