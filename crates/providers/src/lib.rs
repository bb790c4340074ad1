//! Completion backend implementations for AgentRelay.
//!
//! [`OpenAiCompatProvider`] implements the `agentrelay_core::Provider`
//! transport. [`sse`] turns a streamed response body back into text
//! fragments and a final assembled completion.

pub mod openai_compat;
pub mod sse;

pub use openai_compat::OpenAiCompatProvider;
pub use sse::{StreamAggregator, StreamHandle, StreamOutcome, StreamSettings};
