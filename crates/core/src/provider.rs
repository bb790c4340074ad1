//! Provider trait — the transport abstraction over completion backends.
//!
//! A Provider knows how to send a transcript to a completion backend and get
//! the reply back, either as a buffered response or as the raw SSE byte
//! stream. Reassembling that stream is the job of the stream aggregator, not
//! the provider.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// Raw response body chunks of a streaming completion.
pub type ByteStream = BoxStream<'static, std::result::Result<Vec<u8>, ProviderError>>;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// The full conversation history
    pub messages: Vec<Message>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// How the model should pick tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// Tool selection mode sent alongside the tool catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for FinishReason {
    fn from(s: &str) -> Self {
        match s {
            "stop" => Self::Stop,
            // Legacy function-calling backends still report "function_call".
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for FinishReason {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        reason.as_str().to_string()
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message (first choice)
    pub message: Message,

    /// Why generation stopped, if the backend said
    pub finish_reason: Option<FinishReason>,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The core Provider trait.
///
/// The agent loop calls `complete()` or `stream()` without knowing which
/// backend is behind it. Both fail with a [`ProviderError`] on network
/// failure or a non-success status; no retries are attempted.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get the raw SSE response body.
    ///
    /// Default implementation calls `complete()` and renders the result as a
    /// single-delta SSE body terminated by `data: [DONE]`.
    async fn stream(&self, request: ProviderRequest) -> std::result::Result<ByteStream, ProviderError> {
        let response = self.complete(request).await?;
        let body = render_sse(&response);
        Ok(Box::pin(futures::stream::iter([Ok(body)])))
    }
}

/// Render a buffered response as an SSE body with one delta.
pub fn render_sse(response: &ProviderResponse) -> Vec<u8> {
    let tool_calls: Vec<serde_json::Value> = response
        .message
        .tool_calls
        .iter()
        .enumerate()
        .map(|(index, tc)| {
            serde_json::json!({
                "index": index,
                "id": tc.id,
                "type": "function",
                "function": { "name": tc.name, "arguments": tc.arguments },
            })
        })
        .collect();

    let mut delta = serde_json::json!({ "content": response.message.content });
    if !tool_calls.is_empty() {
        delta["tool_calls"] = serde_json::Value::Array(tool_calls);
    }

    let mut payload = serde_json::json!({
        "model": response.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": response.finish_reason.as_ref().map(FinishReason::as_str),
        }],
    });
    if let Some(usage) = response.usage {
        payload["usage"] = serde_json::json!(usage);
    }

    format!("data: {payload}\n\ndata: [DONE]\n\n").into_bytes()
}

impl ProviderResponse {
    /// Convenience for tests and adapters: a plain assistant reply.
    pub fn text(model: impl Into<String>, content: impl Into<String>, finish_reason: FinishReason) -> Self {
        Self {
            message: Message::assistant(content),
            finish_reason: Some(finish_reason),
            usage: None,
            model: model.into(),
        }
    }

    /// Convenience for tests and adapters: an assistant reply requesting tools.
    pub fn tool_calls(model: impl Into<String>, tool_calls: Vec<MessageToolCall>) -> Self {
        Self {
            message: Message::assistant_with_tools("", tool_calls),
            finish_reason: Some(FinishReason::ToolCalls),
            usage: None,
            model: model.into(),
        }
    }
}
