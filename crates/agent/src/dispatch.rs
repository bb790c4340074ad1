//! Tool call dispatch.
//!
//! Turns one [`MessageToolCall`] into one tool-role message. Nothing that
//! happens here is fatal: argument decode failures and executor errors are
//! reported to the model as text so it can recover.

use std::sync::Arc;
use std::time::Instant;

use agentrelay_core::message::{Message, MessageToolCall};
use agentrelay_core::tool::{ToolArguments, ToolExecutor};
use tracing::{debug, warn};

/// Result of dispatching a single tool call.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Tool-role message carrying the originating call id.
    pub message: Message,
    pub success: bool,
    pub duration_ms: u64,
}

impl Dispatched {
    pub fn output(&self) -> &str {
        &self.message.content
    }
}

/// Routes tool calls to a caller-supplied executor.
#[derive(Clone)]
pub struct ToolDispatcher {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolDispatcher {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    pub async fn dispatch(&self, call: &MessageToolCall) -> Dispatched {
        let start = Instant::now();

        let (content, success) = match decode_arguments(&call.arguments) {
            Ok(arguments) => match self.executor.execute(&call.name, arguments).await {
                Ok(result) => (success_text(&call.name, &result), true),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    (failure_text(&call.name, &e.to_string()), false)
                }
            },
            Err(reason) => {
                warn!(tool = %call.name, error = %reason, "Tool arguments could not be decoded");
                (failure_text(&call.name, &reason), false)
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(tool = %call.name, success, duration_ms, "Tool dispatched");

        Dispatched {
            message: Message::tool_result(&call.id, content),
            success,
            duration_ms,
        }
    }
}

/// Decode raw argument text as a JSON object. Blank text is an empty map.
pub fn decode_arguments(raw: &str) -> Result<ToolArguments, String> {
    if raw.trim().is_empty() {
        return Ok(ToolArguments::new());
    }
    serde_json::from_str::<ToolArguments>(raw).map_err(|e| format!("failed to parse arguments: {e}"))
}

pub(crate) fn success_text(name: &str, result: &str) -> String {
    format!("Tool {name} executed successfully. Result: {result}")
}

pub(crate) fn failure_text(name: &str, error: &str) -> String {
    format!("Tool {name} execution failed. Error: {error}")
}
