//! Error types for the AgentRelay domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the agent crate folds the
//! fatal ones into its run error.

use thiserror::Error;

/// Failures of the completion backend transport. Always fatal to a run.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider (status: 429)")]
    RateLimited,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Malformed response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures while reassembling a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Failed to decode stream payload: {reason} (line: {line})")]
    Decode { line: String, reason: String },

    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    #[error("Backend reported an error mid-stream: {0}")]
    Backend(String),

    #[error("Stream closed before completion")]
    Closed,
}

/// Failures reported by a tool executor. Recoverable: the loop folds them
/// into the transcript and keeps going.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}
