//! Provider-agnostic request and stream types.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;

/// A single-turn completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// System prompt.
    pub system: String,
    /// User prompt.
    pub prompt: String,
    /// Maximum tokens the provider may generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whole-request timeout. `None` leaves the client's default in place.
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    /// Creates a request with no explicit timeout.
    #[must_use]
    pub fn new(
        system: impl Into<String>,
        prompt: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens,
            temperature,
            timeout: None,
        }
    }

    /// Sets an explicit timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One event of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text produced by the model.
    TextDelta(String),
    /// The provider signalled the end of the message.
    Done,
}

/// Stream of completion events.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// An LLM backend able to answer single-turn prompts.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Runs the request and returns the full response text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Opens a streamed completion.
    ///
    /// Errors returned from this method happen before any text was produced;
    /// errors yielded by the stream happen mid-response.
    async fn stream(&self, request: &CompletionRequest) -> Result<TextStream>;
}
