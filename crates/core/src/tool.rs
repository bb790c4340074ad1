//! Tool execution seam.
//!
//! The embedding application supplies a [`ToolExecutor`]: given a tool name
//! and a decoded argument map it returns result text or an error. The
//! [`ToolRegistry`] is the batteries-included executor: it routes calls to
//! individually registered [`Tool`]s and produces the catalog sent to the
//! model.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Decoded tool arguments.
pub type ToolArguments = serde_json::Map<String, serde_json::Value>;

/// Executes tool calls on behalf of the agent loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: ToolArguments) -> std::result::Result<String, ToolError>;
}

/// Plain closures work as executors.
#[async_trait]
impl<F> ToolExecutor for F
where
    F: Fn(&str, ToolArguments) -> std::result::Result<String, ToolError> + Send + Sync,
{
    async fn execute(&self, name: &str, arguments: ToolArguments) -> std::result::Result<String, ToolError> {
        self(name, arguments)
    }
}

/// A single named capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "get_weather").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: ToolArguments) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, keyed by name.
///
/// Iteration order is by name so the catalog sent to the model is stable.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, arguments: ToolArguments) -> std::result::Result<String, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments).await
    }
}
