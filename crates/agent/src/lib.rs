//! The agent loop: the heart of AgentRelay.
//!
//! An [`Agent`] is a read-only template (model, tools, limits). Each run
//! threads a [`Session`] through a **request → decide → act** cycle:
//!
//! 1. **Receive** the user input and append it to the session
//! 2. **Send** the full history to the completion backend, buffered or
//!    streamed through the SSE aggregator
//! 3. **If tool calls**: dispatch each one, append the results, loop back
//! 4. **If final**: return the answer
//!
//! The loop stops on a final answer, a fatal error, cancellation or when the
//! iteration budget runs out. Every step is published as an
//! [`AgentEvent`](agentrelay_core::AgentEvent) on the caller's bus.

pub mod collaboration;
pub mod dispatch;
pub mod error;
pub mod loop_runner;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use collaboration::{AgentRegistry, DELEGATE_TOOL_NAME, delegation_tool};
pub use dispatch::{Dispatched, ToolDispatcher};
pub use error::AgentError;
pub use loop_runner::{Agent, RunOutcome};
pub use session::Session;
pub use streaming::{RunCompletion, RunReport, StreamOptions, StreamingRun};
