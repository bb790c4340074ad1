//! # AgentRelay Core
//!
//! Domain types, traits, and error definitions for the AgentRelay agent loop.
//! This crate has **no transport dependencies**: it defines the domain model
//! that the provider and agent crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the loop is defined as a trait here. Implementations
//! live in their respective crates. This enables:
//! - Swapping the completion backend without touching the loop
//! - Easy testing with scripted mock providers and executors
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, StreamError, ToolError};
pub use event::{AgentEvent, AgentEventKind, DEFAULT_EVENT_CAPACITY, ErrorClass, EventBus, EventObserver};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    ByteStream, FinishReason, Provider, ProviderRequest, ProviderResponse, ToolChoice,
    ToolDefinition, Usage,
};
pub use tool::{Tool, ToolArguments, ToolExecutor, ToolRegistry};
