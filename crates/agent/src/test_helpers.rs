//! Shared test helpers for loop and delegation tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agentrelay_core::error::{ProviderError, ToolError};
use agentrelay_core::event::AgentEvent;
use agentrelay_core::message::MessageToolCall;
use agentrelay_core::provider::{
    ByteStream, FinishReason, Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage, render_sse,
};
use agentrelay_core::tool::{ToolArguments, ToolExecutor};
use tokio::sync::mpsc;

enum Script {
    Reply(ProviderResponse),
    Body(String),
    Fail(ProviderError),
}

/// A mock provider that plays back a sequence of scripted replies.
///
/// Each call to `complete` or `stream` consumes the next entry; every
/// request is recorded. Panics if more calls are made than entries
/// provided, unless a repeating reply was set.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    repeat: Option<ProviderResponse>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Script::Reply).collect()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same reply.
    pub fn repeating(response: ProviderResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(vec![])
        }
    }

    /// Fail the first call.
    pub fn failing(error: ProviderError) -> Self {
        let provider = Self::new(vec![]);
        provider.script.lock().unwrap().push_back(Script::Fail(error));
        provider
    }

    /// Queue a raw SSE body, served by the next `stream` call.
    pub fn with_stream_body(self, body: &str) -> Self {
        self.script.lock().unwrap().push_back(Script::Body(body.to_string()));
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: ProviderRequest) -> Script {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        let call = requests.len();

        match self.script.lock().unwrap().pop_front() {
            Some(entry) => entry,
            None => match &self.repeat {
                Some(response) => Script::Reply(response.clone()),
                None => panic!("ScriptedProvider: no more responses (call #{call})"),
            },
        }
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next(request) {
            Script::Reply(response) => Ok(response),
            Script::Fail(error) => Err(error),
            Script::Body(_) => panic!("ScriptedProvider: stream body queued for a buffered call"),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ByteStream, ProviderError> {
        let body = match self.next(request) {
            Script::Reply(response) => render_sse(&response),
            Script::Body(body) => body.into_bytes(),
            Script::Fail(error) => return Err(error),
        };
        // Split so lines straddle chunk boundaries.
        let chunks: Vec<Result<Vec<u8>, ProviderError>> = body.chunks(11).map(|c| Ok(c.to_vec())).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Create a simple text response (no tool calls).
pub fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        ..ProviderResponse::text("mock-model", content, FinishReason::Stop)
    }
}

/// Create a response requesting the given tool calls.
pub fn tool_round(calls: Vec<MessageToolCall>) -> ProviderResponse {
    ProviderResponse::tool_calls("mock-model", calls)
}

/// An `add(a, b)` tool and an executor for it.
pub fn calculator_tools() -> (Vec<ToolDefinition>, Arc<dyn ToolExecutor>) {
    let definition = ToolDefinition {
        name: "add".into(),
        description: "Add two integers".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "integer" }
            },
            "required": ["a", "b"]
        }),
    };
    let executor = |name: &str, args: ToolArguments| -> Result<String, ToolError> {
        if name != "add" {
            return Err(ToolError::NotFound(name.to_string()));
        }
        let operand = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ToolError::InvalidArguments(format!("missing integer '{key}'")))
        };
        Ok((operand("a")? + operand("b")?).to_string())
    };
    (vec![definition], Arc::new(executor))
}

/// Drain a closed event queue.
pub async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
