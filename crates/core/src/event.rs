//! Lifecycle events and the bounded event bus.
//!
//! The agent loop is the single producer. Every subscriber gets its own
//! bounded queue, so a slow or failing observer only ever stalls the loop
//! through backpressure on its own queue, never through an inline call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::provider::FinishReason;

/// Default capacity of each subscriber queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// A timestamped lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: AgentEventKind,
}

/// Events emitted by the agent loop, in production order:
///
/// - `start`              — the run accepted user input
/// - `iteration`          — a new completion round is about to be requested
/// - `assistant_response` — text from the model (streamed fragments have `partial = true`)
/// - `tool_call`          — the loop is dispatching a tool
/// - `tool_result`        — the tool finished (successfully or not)
/// - `final_answer`       — terminal: the run produced an answer
/// - `error`              — terminal: the run stopped without an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    Start {
        agent: String,
        input: String,
    },

    Iteration {
        iteration: u32,
        max_iterations: u32,
    },

    AssistantResponse {
        content: String,
        partial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        #[serde(default)]
        tool_calls: usize,
    },

    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
        duration_ms: u64,
    },

    FinalAnswer {
        answer: String,
        iterations: u32,
    },

    Error {
        class: ErrorClass,
        message: String,
    },
}

/// Why a run ended without a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    Stream,
    UnknownAgent,
    Delegation,
    Cancelled,
    /// Not a failure: the run used its whole iteration budget.
    BudgetExhausted,
}

impl AgentEvent {
    pub fn new(kind: AgentEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            AgentEventKind::Start { .. } => "start",
            AgentEventKind::Iteration { .. } => "iteration",
            AgentEventKind::AssistantResponse { .. } => "assistant_response",
            AgentEventKind::ToolCall { .. } => "tool_call",
            AgentEventKind::ToolResult { .. } => "tool_result",
            AgentEventKind::FinalAnswer { .. } => "final_answer",
            AgentEventKind::Error { .. } => "error",
        }
    }

    /// True for the two kinds that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            AgentEventKind::FinalAnswer { .. } | AgentEventKind::Error { .. }
        )
    }
}

/// A consumer that reacts to each event on its own task.
pub trait EventObserver: Send + 'static {
    fn on_event(&mut self, event: &AgentEvent);
}

impl<F> EventObserver for F
where
    F: FnMut(&AgentEvent) + Send + 'static,
{
    fn on_event(&mut self, event: &AgentEvent) {
        self(event)
    }
}

/// Ordered fan-out of lifecycle events to bounded subscriber queues.
///
/// Closing the bus (dropping it) is the end-of-stream signal: every
/// subscriber's `recv()` returns `None` once the queued events are drained.
#[derive(Debug, Default)]
pub struct EventBus {
    senders: Vec<mpsc::Sender<AgentEvent>>,
}

impl EventBus {
    /// A bus with no subscribers. Publishing is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with one primary subscriber queue of the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let mut bus = Self::new();
        let rx = bus.subscribe(capacity);
        (bus, rx)
    }

    /// Add a subscriber queue. Must happen before the run starts publishing.
    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.senders.push(tx);
        rx
    }

    /// Run `observer` on its own task, fed by a dedicated queue.
    pub fn observe<O: EventObserver>(&mut self, capacity: usize, mut observer: O) -> JoinHandle<()> {
        let mut rx = self.subscribe(capacity);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                observer.on_event(&event);
            }
        })
    }

    /// Deliver an event to every live subscriber, waiting for queue space.
    pub async fn publish(&self, event: AgentEvent) {
        for tx in &self.senders {
            // A dropped receiver just stops listening; the run goes on.
            if tx.send(event.clone()).await.is_err() {
                tracing::trace!(event = event.event_type(), "Event subscriber gone");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.len()
    }

    /// Signal end-of-stream to all subscribers.
    pub fn close(self) {
        drop(self);
    }
}
