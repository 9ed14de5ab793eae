//! Drill core
//!
//! Retry policy, streaming feedback decoder, session progression rules and
//! the HTTP API that ties them together.

pub mod api;
pub mod config;
pub mod decoder;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod progression;
pub mod retry;

#[cfg(test)]
mod test_support;

pub use api::{create_router, AppState, ErrorResponse, HealthResponse, PingResponse};
pub use config::{
    Config, DatabaseConfig, Environment, LlmConfig, ProgressionConfig, RetryConfig, ServerConfig,
    API_KEY_ENV, ENVIRONMENT_ENV,
};
pub use decoder::{parse_evaluation, Evaluation, EvaluationError, FeedbackDecoder, ScanState};
pub use error::{DrillError, Result};
pub use evaluation::Evaluator;
pub use events::SubmissionEvent;
pub use progression::{
    HintRequest, HintResult, ModuleImport, NewSession, PendingSubmission, Progression,
    SessionUpdate, SubmissionResult, SubmitAnswer,
};
pub use retry::{Decision, FailureKind, RetryPolicy, Retryable, TimeoutSlot};
