//! The agent reasoning loop implementation.

use std::collections::HashMap;
use std::sync::Arc;

use agentrelay_config::{AgentProfile, AppConfig};
use agentrelay_core::error::StreamError;
use agentrelay_core::event::{AgentEvent, AgentEventKind, ErrorClass, EventBus};
use agentrelay_core::message::{Message, MessageToolCall};
use agentrelay_core::provider::{FinishReason, Provider, ProviderRequest, ProviderResponse, ToolChoice, ToolDefinition};
use agentrelay_core::tool::{ToolExecutor, ToolRegistry};
use agentrelay_providers::{StreamAggregator, StreamHandle, StreamSettings};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaboration::{self, AgentRegistry, DELEGATE_TOOL_NAME};
use crate::dispatch::{Dispatched, ToolDispatcher};
use crate::error::AgentError;
use crate::session::Session;

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model produced a final answer.
    Answer(String),
    /// The iteration budget ran out first.
    BudgetExhausted { iterations: u32 },
}

impl RunOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            Self::Answer(text) => Some(text),
            Self::BudgetExhausted { .. } => None,
        }
    }
}

/// An agent template: everything a run needs except the conversation.
///
/// Runs never mutate the template, so one `Arc<Agent>` can back any number
/// of sessions.
pub struct Agent {
    name: String,
    description: String,
    model: String,
    system_prompt: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_iterations: u32,
    tools: Vec<ToolDefinition>,
    tool_choice: ToolChoice,
    dispatcher: ToolDispatcher,
    provider: Arc<dyn Provider>,
    streaming: Option<StreamSettings>,
}

/// Per-run wiring shared by a run and the peer runs it delegates to.
pub(crate) struct RunContext<'a> {
    pub(crate) bus: &'a EventBus,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) peers: Option<&'a AgentRegistry>,
    pub(crate) budgets: &'a mut Budgets,
}

/// Backend calls charged to each agent that has a run on the delegation
/// stack.
///
/// Nested runs of an agent that is already active draw on the same count,
/// so a delegation cycle ends in budget exhaustion. The count is dropped
/// when the agent's outermost run returns, so the next delegation to it
/// starts with its full `max_iterations`.
#[derive(Debug, Default)]
pub(crate) struct Budgets {
    active: HashMap<String, ActiveRuns>,
}

#[derive(Debug, Default)]
struct ActiveRuns {
    depth: u32,
    calls: u32,
}

impl Budgets {
    fn enter(&mut self, agent: &str) {
        self.active.entry(agent.to_string()).or_default().depth += 1;
    }

    fn leave(&mut self, agent: &str) {
        if let Some(runs) = self.active.get_mut(agent) {
            runs.depth = runs.depth.saturating_sub(1);
            if runs.depth == 0 {
                self.active.remove(agent);
            }
        }
    }

    /// Charge one backend call, or return `false` if none are left.
    fn charge(&mut self, agent: &str, max_iterations: u32) -> bool {
        let runs = self.active.entry(agent.to_string()).or_default();
        if runs.calls >= max_iterations {
            return false;
        }
        runs.calls += 1;
        true
    }
}

enum Decision {
    Final,
    ToolRound,
}

impl Agent {
    /// Create an agent with no tools and default limits.
    pub fn new(name: impl Into<String>, provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model: model.into(),
            system_prompt: "You are a helpful assistant.".into(),
            temperature: None,
            max_tokens: None,
            max_iterations: 10,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            dispatcher: ToolDispatcher::new(Arc::new(ToolRegistry::new())),
            provider,
            streaming: None,
        }
    }

    /// Build the primary agent from the `[agent]` and `[streaming]` sections.
    pub fn from_config(config: &AppConfig, provider: Arc<dyn Provider>) -> Self {
        let mut agent = Self::new(&config.agent.name, provider, &config.default_model)
            .with_system_prompt(&config.agent.system_prompt)
            .with_temperature(config.default_temperature)
            .with_max_iterations(config.agent.max_iterations);
        agent.max_tokens = config.agent.max_tokens;
        if config.streaming.enabled {
            agent.streaming = Some(StreamSettings::from(&config.streaming));
        }
        agent
    }

    /// Build a peer agent from an `[[agents]]` entry, inheriting the rest.
    pub fn from_profile(profile: &AgentProfile, config: &AppConfig, provider: Arc<dyn Provider>) -> Self {
        let model = profile.model.as_deref().unwrap_or(&config.default_model);
        let mut agent = Self::new(&profile.name, provider, model)
            .with_description(&profile.description)
            .with_system_prompt(&profile.system_prompt)
            .with_temperature(profile.temperature.unwrap_or(config.default_temperature))
            .with_max_iterations(profile.max_iterations.unwrap_or(config.agent.max_iterations));
        agent.max_tokens = config.agent.max_tokens;
        if config.streaming.enabled {
            agent.streaming = Some(StreamSettings::from(&config.streaming));
        }
        agent
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the default max tokens per LLM response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of backend calls per run.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Advertise `tools` to the model and execute calls with `executor`.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self.dispatcher = ToolDispatcher::new(executor);
        self
    }

    /// How the model may pick tools. Only sent when the catalog is not empty.
    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    /// Use a registry as both the catalog and the executor.
    pub fn with_registry(self, registry: ToolRegistry) -> Self {
        let tools = registry.definitions();
        self.with_tools(tools, Arc::new(registry))
    }

    /// Drive completions through the SSE aggregator instead of buffering.
    pub fn with_streaming(mut self, settings: StreamSettings) -> Self {
        self.streaming = Some(settings);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// A fresh session seeded with this agent's system prompt.
    pub fn new_session(&self) -> Session {
        Session::new(&self.system_prompt)
    }

    /// Run one user turn to completion.
    ///
    /// Events are published to `bus` in order, ending with exactly one
    /// `final_answer` or `error` event. The bus is left open; dropping it
    /// signals end-of-stream to its subscribers.
    pub async fn run(
        &self,
        session: &mut Session,
        input: &str,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let mut budgets = Budgets::default();
        let ctx = RunContext {
            bus,
            cancel,
            peers: None,
            budgets: &mut budgets,
        };
        self.drive(session, input, ctx).await
    }

    /// Like [`Agent::run`], but the model may hand sub-tasks to `peers`.
    pub async fn run_with_peers(
        &self,
        session: &mut Session,
        input: &str,
        bus: &EventBus,
        cancel: &CancellationToken,
        peers: &AgentRegistry,
    ) -> Result<RunOutcome, AgentError> {
        let mut budgets = Budgets::default();
        let ctx = RunContext {
            bus,
            cancel,
            peers: Some(peers),
            budgets: &mut budgets,
        };
        self.drive(session, input, ctx).await
    }

    /// Boxed so that delegation can recurse into a peer's loop.
    pub(crate) fn drive<'a>(
        &'a self,
        session: &'a mut Session,
        input: &'a str,
        mut ctx: RunContext<'a>,
    ) -> BoxFuture<'a, Result<RunOutcome, AgentError>> {
        Box::pin(async move {
            info!(
                agent = %self.name,
                session = %session.id,
                messages = session.len(),
                "Processing run"
            );

            session.reset_iterations();
            session.push(Message::user(input));
            ctx.budgets.enter(&self.name);

            let start = AgentEventKind::Start {
                agent: self.name.clone(),
                input: input.to_string(),
            };
            let result = match self.emit(&ctx, start).await {
                Ok(()) => self.iterate(session, &mut ctx).await,
                Err(e) => Err(e),
            };

            let terminal = match &result {
                Ok(RunOutcome::Answer(answer)) => {
                    info!(agent = %self.name, iterations = session.iterations(), "Run finished");
                    AgentEventKind::FinalAnswer {
                        answer: answer.clone(),
                        iterations: session.iterations(),
                    }
                }
                Ok(RunOutcome::BudgetExhausted { iterations }) => AgentEventKind::Error {
                    class: ErrorClass::BudgetExhausted,
                    message: format!("Max iterations ({iterations}) reached without a final answer"),
                },
                Err(e) => {
                    warn!(agent = %self.name, error = %e, "Run failed");
                    AgentEventKind::Error {
                        class: e.class(),
                        message: e.to_string(),
                    }
                }
            };
            // The terminal event goes out even after cancellation if the
            // queue has room.
            let _ = self.emit(&ctx, terminal).await;
            ctx.budgets.leave(&self.name);

            result
        })
    }

    async fn iterate(&self, session: &mut Session, ctx: &mut RunContext<'_>) -> Result<RunOutcome, AgentError> {
        let catalog = self.catalog(ctx.peers);

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            if !ctx.budgets.charge(&self.name, self.max_iterations) {
                warn!(
                    agent = %self.name,
                    iterations = session.iterations(),
                    max_iterations = self.max_iterations,
                    "Max iterations reached"
                );
                return Ok(RunOutcome::BudgetExhausted {
                    iterations: session.iterations(),
                });
            }
            let iteration = session.next_iteration();

            debug!(agent = %self.name, iteration, "Agent loop iteration");
            self.emit(
                ctx,
                AgentEventKind::Iteration {
                    iteration,
                    max_iterations: self.max_iterations,
                },
            )
            .await?;

            let request = self.request(session, &catalog);
            let response = match self.streaming {
                Some(settings) => self.stream_completion(request, settings, ctx).await?,
                None => self.complete(request, ctx.cancel).await?,
            };

            let ProviderResponse {
                message,
                finish_reason,
                usage,
                ..
            } = response;
            if let Some(usage) = usage {
                debug!(agent = %self.name, tokens = usage.total_tokens, "Completion usage");
            }

            self.emit(
                ctx,
                AgentEventKind::AssistantResponse {
                    content: message.content.clone(),
                    partial: false,
                    finish_reason: finish_reason.clone(),
                    tool_calls: message.tool_calls.len(),
                },
            )
            .await?;

            let decision = decide(finish_reason.as_ref(), catalog.is_empty(), !message.tool_calls.is_empty());
            let calls = message.tool_calls.clone();
            let content = message.content.clone();
            session.push(message);

            match decision {
                Decision::Final => return Ok(RunOutcome::Answer(content)),
                Decision::ToolRound => {
                    debug!(agent = %self.name, tool_count = calls.len(), "Executing tool calls");
                    for call in &calls {
                        self.run_tool(call, session, ctx).await?;
                    }
                }
            }
        }
    }

    async fn run_tool(
        &self,
        call: &MessageToolCall,
        session: &mut Session,
        ctx: &mut RunContext<'_>,
    ) -> Result<(), AgentError> {
        self.emit(
            ctx,
            AgentEventKind::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        )
        .await?;

        let dispatched = match ctx.peers {
            Some(peers) if call.name == DELEGATE_TOOL_NAME => {
                collaboration::delegate(call, peers, ctx.cancel, ctx.budgets).await?
            }
            _ => self.dispatch(call, ctx.cancel).await?,
        };

        self.emit(
            ctx,
            AgentEventKind::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                output: dispatched.output().to_string(),
                success: dispatched.success,
                duration_ms: dispatched.duration_ms,
            },
        )
        .await?;

        session.push(dispatched.message);
        Ok(())
    }

    async fn dispatch(&self, call: &MessageToolCall, cancel: &CancellationToken) -> Result<Dispatched, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            dispatched = self.dispatcher.dispatch(call) => Ok(dispatched),
        }
    }

    fn catalog(&self, peers: Option<&AgentRegistry>) -> Vec<ToolDefinition> {
        let mut tools = self.tools.clone();
        if let Some(peers) = peers {
            tools.push(collaboration::delegation_tool(peers));
        }
        tools
    }

    fn request(&self, session: &Session, tools: &[ToolDefinition]) -> ProviderRequest {
        ProviderRequest {
            model: self.model.clone(),
            messages: session.history().to_vec(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.to_vec(),
            tool_choice: (!tools.is_empty()).then_some(self.tool_choice),
        }
    }

    async fn complete(&self, request: ProviderRequest, cancel: &CancellationToken) -> Result<ProviderResponse, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            response = self.provider.complete(request) => Ok(response?),
        }
    }

    /// Stream a completion, forwarding fragments as partial responses.
    async fn stream_completion(
        &self,
        request: ProviderRequest,
        settings: StreamSettings,
        ctx: &RunContext<'_>,
    ) -> Result<ProviderResponse, AgentError> {
        let bytes = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
            bytes = self.provider.stream(request) => bytes?,
        };

        let StreamHandle { mut fragments, done } = StreamAggregator::spawn(bytes, settings);

        loop {
            let fragment = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                fragment = fragments.recv() => fragment,
            };
            let Some(content) = fragment else { break };
            self.emit(
                ctx,
                AgentEventKind::AssistantResponse {
                    content,
                    partial: true,
                    finish_reason: None,
                    tool_calls: 0,
                },
            )
            .await?;
        }

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = done => outcome.unwrap_or(Err(StreamError::Closed))?,
        };
        Ok(outcome.into_response())
    }

    async fn emit(&self, ctx: &RunContext<'_>, kind: AgentEventKind) -> Result<(), AgentError> {
        tokio::select! {
            biased;
            _ = ctx.bus.publish(AgentEvent::new(kind)) => Ok(()),
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }
}

fn decide(finish_reason: Option<&FinishReason>, no_tools: bool, has_tool_calls: bool) -> Decision {
    match finish_reason {
        Some(FinishReason::Stop) => Decision::Final,
        _ if no_tools => Decision::Final,
        Some(FinishReason::ToolCalls) => Decision::ToolRound,
        _ if has_tool_calls => Decision::ToolRound,
        _ => Decision::Final,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, calculator_tools, collect_events, text, tool_round};
    use agentrelay_core::error::{ProviderError, ToolError};
    use agentrelay_core::message::Role;
    use agentrelay_core::tool::ToolArguments;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent(provider: Arc<ScriptedProvider>) -> Agent {
        Agent::new("helper", provider, "mock-model").with_system_prompt("You are a helper")
    }

    async fn run_collecting(agent: &Agent, session: &mut Session, input: &str) -> (Result<RunOutcome, AgentError>, Vec<AgentEvent>) {
        let (bus, rx) = EventBus::channel(256);
        let result = agent.run(session, input, &bus, &CancellationToken::new()).await;
        drop(bus);
        (result, collect_events(rx).await)
    }

    #[tokio::test]
    async fn simple_text_response() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("Final Answer: 4")]));
        let agent = agent(provider.clone());

        let mut session = agent.new_session();
        let (result, _) = run_collecting(&agent, &mut session, "2+2?").await;

        assert_eq!(result.unwrap(), RunOutcome::Answer("Final Answer: 4".into()));
        // System + User + Assistant = 3 messages
        assert_eq!(session.len(), 3);
        let roles: Vec<Role> = session.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(session.history()[0].content, "You are a helper");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn two_tool_calls_then_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round(vec![
                MessageToolCall::new("call_a", "add", json!({"a": 1, "b": 2}).to_string()),
                MessageToolCall::new("call_b", "add", json!({"a": 3, "b": 4}).to_string()),
            ]),
            text("3 and 7"),
        ]));
        let (tools, executor) = calculator_tools();
        let agent = agent(provider.clone()).with_tools(tools, executor);

        let mut session = agent.new_session();
        let (result, _) = run_collecting(&agent, &mut session, "add things").await;
        assert_eq!(result.unwrap().answer(), Some("3 and 7"));

        // The second request saw system, user, assistant and two tool results.
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        assert_eq!(second.len(), 5);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(second[3].content, "Tool add executed successfully. Result: 3");
        assert_eq!(second[4].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(second[4].content, "Tool add executed successfully. Result: 7");

        assert_eq!(session.len(), 6);
        assert_eq!(session.iterations(), 2);
    }

    #[tokio::test]
    async fn budget_exhaustion_makes_exactly_n_calls() {
        let looping = tool_round(vec![MessageToolCall::new("call_1", "add", r#"{"a":1,"b":1}"#)]);
        let provider = Arc::new(ScriptedProvider::repeating(looping));
        let (tools, executor) = calculator_tools();
        let agent = agent(provider.clone()).with_tools(tools, executor).with_max_iterations(3);

        let mut session = agent.new_session();
        let (result, events) = run_collecting(&agent, &mut session, "loop forever").await;

        assert_eq!(result.unwrap(), RunOutcome::BudgetExhausted { iterations: 3 });
        assert_eq!(provider.call_count(), 3);
        // system + user + 3 × (assistant + tool)
        assert_eq!(session.len(), 8);

        let last = events.last().unwrap();
        assert!(matches!(
            &last.kind,
            AgentEventKind::Error { class: ErrorClass::BudgetExhausted, .. }
        ));
    }

    #[tokio::test]
    async fn failing_executor_does_not_abort_run() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round(vec![MessageToolCall::new("call_1", "flaky", "{}")]),
            text("recovered"),
        ]));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = move |_name: &str, _args: ToolArguments| -> Result<String, ToolError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::ExecutionFailed("boom".into()))
        };
        let agent = agent(provider.clone()).with_tools(
            vec![ToolDefinition {
                name: "flaky".into(),
                description: "Always fails".into(),
                parameters: json!({"type": "object"}),
            }],
            Arc::new(executor),
        );

        let mut session = agent.new_session();
        let (result, events) = run_collecting(&agent, &mut session, "try it").await;

        assert_eq!(result.unwrap().answer(), Some("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.history()[3].content, "Tool flaky execution failed. Error: boom");
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AgentEventKind::ToolResult { success: false, .. }
        )));
    }

    #[tokio::test]
    async fn tool_result_event_reports_duration() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round(vec![MessageToolCall::new("call_1", "slow", "{}")]),
            text("done"),
        ]));
        let executor = |_name: &str, _args: ToolArguments| -> Result<String, ToolError> {
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok("finally".into())
        };
        let agent = agent(provider).with_tools(
            vec![ToolDefinition {
                name: "slow".into(),
                description: "Takes a while".into(),
                parameters: json!({"type": "object"}),
            }],
            Arc::new(executor),
        );

        let mut session = agent.new_session();
        let (_, events) = run_collecting(&agent, &mut session, "wait").await;

        let duration = events
            .iter()
            .find_map(|e| match &e.kind {
                AgentEventKind::ToolResult { duration_ms, .. } => Some(*duration_ms),
                _ => None,
            })
            .unwrap();
        assert!(duration >= 20, "duration_ms = {duration}");
    }

    #[tokio::test]
    async fn malformed_arguments_reach_next_iteration() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round(vec![MessageToolCall::new("call_1", "add", "{not json")]),
            text("sorry"),
        ]));
        let (tools, executor) = calculator_tools();
        let agent = agent(provider.clone()).with_tools(tools, executor);

        let mut session = agent.new_session();
        let (result, _) = run_collecting(&agent, &mut session, "add").await;
        assert_eq!(result.unwrap().answer(), Some("sorry"));
        assert_eq!(provider.call_count(), 2);
        assert!(session.history()[3].content.contains("failed to parse arguments"));
    }

    #[tokio::test]
    async fn events_begin_with_start_and_end_with_one_terminal() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_round(vec![MessageToolCall::new("call_1", "add", r#"{"a":2,"b":2}"#)]),
            text("4"),
        ]));
        let (tools, executor) = calculator_tools();
        let agent = agent(provider).with_tools(tools, executor);

        let mut session = agent.new_session();
        let (_, events) = run_collecting(&agent, &mut session, "2+2?").await;

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![
                "start",
                "iteration",
                "assistant_response",
                "tool_call",
                "tool_result",
                "iteration",
                "assistant_response",
                "final_answer",
            ]
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn transport_error_is_fatal_and_reported_once() {
        let provider = Arc::new(ScriptedProvider::failing(ProviderError::ApiError {
            status_code: 500,
            message: "upstream down".into(),
        }));
        let agent = agent(provider);

        let mut session = agent.new_session();
        let (result, events) = run_collecting(&agent, &mut session, "hello").await;

        assert!(matches!(result, Err(AgentError::Provider(ProviderError::ApiError { status_code: 500, .. }))));
        // Partial transcript is kept.
        assert_eq!(session.len(), 2);
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(
            &terminal[0].kind,
            AgentEventKind::Error { class: ErrorClass::Transport, .. }
        ));
    }

    #[tokio::test]
    async fn no_tools_configured_means_final_even_on_tool_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![tool_round(vec![MessageToolCall::new(
            "call_1", "add", "{}",
        )])]));
        let agent = agent(provider.clone());

        let mut session = agent.new_session();
        let (result, _) = run_collecting(&agent, &mut session, "hi").await;
        assert_eq!(result.unwrap().answer(), Some(""));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn length_finish_with_tool_calls_runs_the_tools() {
        let mut truncated = tool_round(vec![MessageToolCall::new("call_1", "add", r#"{"a":1,"b":1}"#)]);
        truncated.finish_reason = Some(FinishReason::Length);
        let provider = Arc::new(ScriptedProvider::new(vec![truncated, text("2")]));
        let (tools, executor) = calculator_tools();
        let agent = agent(provider.clone()).with_tools(tools, executor);

        let mut session = agent.new_session();
        let (result, _) = run_collecting(&agent, &mut session, "1+1").await;
        assert_eq!(result.unwrap().answer(), Some("2"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn second_run_resets_iterations_and_extends_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("one"), text("two")]));
        let agent = agent(provider).with_max_iterations(1);

        let mut session = agent.new_session();
        let (first, _) = run_collecting(&agent, &mut session, "first").await;
        let (second, _) = run_collecting(&agent, &mut session, "second").await;

        assert_eq!(first.unwrap().answer(), Some("one"));
        assert_eq!(second.unwrap().answer(), Some("two"));
        assert_eq!(session.len(), 5);
        assert_eq!(session.iterations(), 1);
    }

    #[tokio::test]
    async fn request_carries_template_settings() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("ok")]));
        let (tools, executor) = calculator_tools();
        let agent = agent(provider.clone())
            .with_tools(tools, executor)
            .with_temperature(0.2)
            .with_max_tokens(256);

        let mut session = agent.new_session();
        run_collecting(&agent, &mut session, "hi").await.0.unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.model, "mock-model");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tool_choice, Some(ToolChoice::Auto));
    }

    #[tokio::test]
    async fn tool_choice_is_sent_only_with_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("ok"), text("ok")]));
        let (tools, executor) = calculator_tools();
        let with_tools = agent(provider.clone())
            .with_tools(tools, executor)
            .with_tool_choice(ToolChoice::Required);
        let bare = agent(provider.clone()).with_tool_choice(ToolChoice::None);

        run_collecting(&with_tools, &mut with_tools.new_session(), "hi").await.0.unwrap();
        run_collecting(&bare, &mut bare.new_session(), "hi").await.0.unwrap();

        let requests = provider.requests();
        assert_eq!(requests[0].tool_choice, Some(ToolChoice::Required));
        assert_eq!(requests[1].tool_choice, None);
    }

    #[tokio::test]
    async fn streaming_mode_emits_partial_fragments() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_stream_body(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n\
             data: [DONE]\n\n",
        ));
        let agent = agent(provider).with_streaming(StreamSettings {
            chunk_size: 1,
            ..StreamSettings::default()
        });

        let mut session = agent.new_session();
        let (result, events) = run_collecting(&agent, &mut session, "greet").await;
        assert_eq!(result.unwrap().answer(), Some("Hello"));

        let partials: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                AgentEventKind::AssistantResponse { content, partial: true, .. } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(partials, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(session.last().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn streaming_decode_error_aborts_after_partial_output() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_stream_body(
            "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\ndata: {broken\n\n",
        ));
        let agent = agent(provider).with_streaming(StreamSettings::default());

        let mut session = agent.new_session();
        let (result, events) = run_collecting(&agent, &mut session, "go").await;

        assert!(matches!(result, Err(AgentError::Stream(StreamError::Decode { .. }))));
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AgentEventKind::AssistantResponse { content, partial: true, .. } if content == "par"
        )));
        assert!(matches!(
            &events.last().unwrap().kind,
            AgentEventKind::Error { class: ErrorClass::Stream, .. }
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("never")]));
        let agent = agent(provider.clone());
        let (bus, rx) = EventBus::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut session = agent.new_session();
        let result = agent.run(&mut session, "hi", &bus, &cancel).await;
        drop(bus);

        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(provider.call_count(), 0);
        let events = collect_events(rx).await;
        assert!(matches!(
            &events.last().unwrap().kind,
            AgentEventKind::Error { class: ErrorClass::Cancelled, .. }
        ));
    }

    #[test]
    fn decision_table() {
        assert!(matches!(decide(Some(&FinishReason::Stop), false, true), Decision::Final));
        assert!(matches!(decide(Some(&FinishReason::ToolCalls), false, false), Decision::ToolRound));
        assert!(matches!(decide(Some(&FinishReason::ToolCalls), true, true), Decision::Final));
        assert!(matches!(decide(Some(&FinishReason::ContentFilter), false, false), Decision::Final));
        assert!(matches!(decide(None, false, true), Decision::ToolRound));
    }

    #[test]
    fn from_config_applies_sections() {
        let mut config = AppConfig::default();
        config.agent.name = "primary".into();
        config.agent.max_iterations = 4;
        config.agent.max_tokens = Some(512);
        config.streaming.enabled = true;
        config.streaming.chunk_size = 16;

        let agent = Agent::from_config(&config, Arc::new(ScriptedProvider::new(vec![])));
        assert_eq!(agent.name(), "primary");
        assert_eq!(agent.max_iterations(), 4);
        assert_eq!(agent.model(), config.default_model);
        assert!(agent.is_streaming());
        assert_eq!(agent.new_session().system_prompt(), Some(config.agent.system_prompt.as_str()));
    }
}
