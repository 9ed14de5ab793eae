//! Drill LLM client
//!
//! Provider contract used by the evaluation service, plus the Anthropic
//! Messages API implementation (buffered and streaming).

pub mod anthropic;
pub mod error;
pub mod provider;

pub use anthropic::{AnthropicClient, DEFAULT_BASE_URL, DEFAULT_MODEL};
pub use error::{LlmError, Result};
pub use provider::{CompletionRequest, LlmProvider, StreamEvent, TextStream};
