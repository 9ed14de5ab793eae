//! Anthropic Messages API client.
//!
//! Implements [`LlmProvider`] against `POST /v1/messages`, both buffered and
//! as a server-sent event stream.
//!
//! # Example
//!
//! ```no_run
//! use drill_llm::{AnthropicClient, CompletionRequest, LlmProvider};
//!
//! # async fn example() -> drill_llm::Result<()> {
//! let client = AnthropicClient::new("sk-ant-...")?;
//! let request = CompletionRequest::new("You are terse.", "Say hi", 64, 0.5);
//! let text = client.complete(&request).await?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LlmError, Result};
use crate::provider::{CompletionRequest, LlmProvider, StreamEvent, TextStream};

/// Default API origin.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// API version header value.
const API_VERSION: &str = "2023-06-01";

/// Connect timeout applied to every request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [Message<'a>; 1],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// Client for the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    /// Creates a client for the public API endpoint and default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    /// Points the client at a different origin (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Selects the model used for every request.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Returns the configured model.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(&self, request: &CompletionRequest, stream: bool) -> RequestBuilder {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
            stream,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<Response> {
        debug!(
            model = %self.model,
            max_tokens = request.max_tokens,
            stream,
            timeout_secs = request.timeout.map(|t| t.as_secs_f64()),
            "Sending LLM request"
        );

        let response = self.build(request, stream).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self.send(request, false).await?;
        let body: MessagesResponse = response.json().await?;

        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect();

        if text.is_empty() {
            return Err(LlmError::Decode("response contained no text blocks".into()));
        }
        Ok(text)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<TextStream> {
        let response = self.send(request, true).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|event| {
                let event = event.map_err(|e| LlmError::Stream(e.to_string()))?;
                parse_sse_event(&event.event, &event.data)
            })
            .filter_map(|result| async move { result.transpose() });

        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Response Handling
// ============================================================================

/// Converts a non-success response into an [`LlmError`].
///
/// 429 becomes [`LlmError::RateLimited`], carrying the `retry-after` header
/// when the provider sent one.
async fn error_from_response(response: Response) -> LlmError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited {
            retry_after,
            message,
        }
    } else {
        LlmError::status(status.as_u16(), message)
    }
}

/// Reads `retry-after` as a number of seconds.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Maps one Anthropic SSE event to a [`StreamEvent`].
///
/// Returns `Ok(None)` for bookkeeping events (`message_start`, `ping`,
/// non-text deltas) and `Err` for `error` events or malformed payloads.
pub fn parse_sse_event(event: &str, data: &str) -> Result<Option<StreamEvent>> {
    match event {
        "message_stop" => Ok(Some(StreamEvent::Done)),
        "error" => Err(LlmError::Stream(format!("provider error event: {data}"))),
        "content_block_delta" => {
            if data.is_empty() {
                return Ok(None);
            }
            let value: serde_json::Value = serde_json::from_str(data)
                .map_err(|e| LlmError::Stream(format!("invalid delta payload: {e}")))?;
            let Some(delta) = value.get("delta") else {
                return Ok(None);
            };
            if delta.get("type").and_then(serde_json::Value::as_str) != Some("text_delta") {
                return Ok(None);
            }
            let text = delta
                .get("text")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            Ok(Some(StreamEvent::TextDelta(text.to_string())))
        }
        _ => Ok(None),
    }
}
