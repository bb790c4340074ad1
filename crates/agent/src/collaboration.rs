//! Agent-to-agent delegation.
//!
//! A run started with an [`AgentRegistry`] advertises one extra tool,
//! `delegate_to_agent`. When the model calls it, the named peer runs its
//! own loop to completion on a fresh session and its final answer becomes
//! the tool result.
//!
//! ```text
//!  parent loop ──delegate_to_agent{agent, task}──▶ peer loop
//!       ▲                                              │
//!       └──────────── tool result = peer answer ◀──────┘
//! ```
//!
//! Naming a peer that does not exist aborts the parent run; ordinary tool
//! failures do not. Each delegation gets the peer's full iteration budget.
//! Cycles are not detected: runs of an agent nested inside another of its
//! runs share that run's budget, so a cycle ends in budget exhaustion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use agentrelay_config::AppConfig;
use agentrelay_core::event::EventBus;
use agentrelay_core::message::{Message, MessageToolCall};
use agentrelay_core::provider::{Provider, ToolDefinition};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{self, Dispatched};
use crate::error::AgentError;
use crate::loop_runner::{Agent, Budgets, RunContext, RunOutcome};

/// Reserved tool name that triggers delegation.
pub const DELEGATE_TOOL_NAME: &str = "delegate_to_agent";

/// Named peers available for delegation.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under its own name, replacing any previous one.
    pub fn register(&mut self, agent: Arc<Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.get(name)
    }

    /// Peer names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// One peer per `[[agents]]` entry, all backed by `provider`.
    pub fn from_config(config: &AppConfig, provider: Arc<dyn Provider>) -> Self {
        let mut registry = Self::new();
        for profile in &config.agents {
            registry.register(Arc::new(Agent::from_profile(profile, config, provider.clone())));
        }
        registry
    }

    /// Run a peer by name on a fresh session, outside of any parent run.
    pub async fn run_agent(
        &self,
        name: &str,
        task: &str,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let agent = self.get(name).ok_or_else(|| AgentError::UnknownAgent(name.to_string()))?;
        let mut session = agent.new_session();
        agent.run_with_peers(&mut session, task, bus, cancel, self).await
    }
}

/// The tool definition advertised when peers are available.
pub fn delegation_tool(peers: &AgentRegistry) -> ToolDefinition {
    let mut description =
        String::from("Delegate a self-contained task to another agent and receive its final answer. Available agents:");
    for name in peers.names() {
        let peer = &peers.agents[name];
        if peer.description().is_empty() {
            description.push_str(&format!("\n- {name}"));
        } else {
            description.push_str(&format!("\n- {name}: {}", peer.description()));
        }
    }

    ToolDefinition {
        name: DELEGATE_TOOL_NAME.into(),
        description,
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": peers.names(),
                    "description": "Name of the agent to delegate to"
                },
                "task": {
                    "type": "string",
                    "description": "The task for that agent, phrased as a complete request"
                }
            },
            "required": ["agent", "task"]
        }),
    }
}

#[derive(Debug, Deserialize)]
struct DelegationRequest {
    agent: String,
    task: String,
}

/// Run the requested peer and turn its outcome into a tool result.
pub(crate) async fn delegate(
    call: &MessageToolCall,
    peers: &AgentRegistry,
    cancel: &CancellationToken,
    budgets: &mut Budgets,
) -> Result<Dispatched, AgentError> {
    let start = Instant::now();
    let finish = |content: String, success: bool| Dispatched {
        message: Message::tool_result(&call.id, content),
        success,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    let request = match dispatch::decode_arguments(&call.arguments)
        .and_then(|args| {
            serde_json::from_value::<DelegationRequest>(serde_json::Value::Object(args))
                .map_err(|e| format!("invalid delegation request: {e}"))
        }) {
        Ok(request) => request,
        Err(reason) => {
            warn!(error = %reason, "Malformed delegation request");
            return Ok(finish(dispatch::failure_text(DELEGATE_TOOL_NAME, &reason), false));
        }
    };

    let peer = peers
        .get(&request.agent)
        .ok_or_else(|| AgentError::UnknownAgent(request.agent.clone()))?;

    info!(agent = %request.agent, "Delegating task to peer");

    // Peer events stay with the peer.
    let silent = EventBus::new();
    let mut session = peer.new_session();
    let ctx = RunContext {
        bus: &silent,
        cancel,
        peers: Some(peers),
        budgets,
    };

    let result = peer.drive(&mut session, &request.task, ctx).await;
    match result {
        Ok(RunOutcome::Answer(answer)) => {
            debug!(agent = %request.agent, iterations = session.iterations(), "Peer answered");
            Ok(finish(answer, true))
        }
        Ok(RunOutcome::BudgetExhausted { iterations }) => {
            warn!(agent = %request.agent, iterations, "Peer exhausted its iteration budget");
            let reason = format!(
                "agent {} stopped after {iterations} iterations without a final answer",
                request.agent
            );
            Ok(finish(dispatch::failure_text(DELEGATE_TOOL_NAME, &reason), false))
        }
        Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
        Err(source) => Err(AgentError::Delegation {
            agent: request.agent,
            source: Box::new(source),
        }),
    }
}
