//! Fatal run errors.

use agentrelay_core::error::{ProviderError, StreamError};
use agentrelay_core::event::ErrorClass;
use thiserror::Error;

/// Why a run stopped without an answer.
///
/// Tool failures never show up here: they are folded into the transcript
/// and the run continues.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Delegation to agent '{agent}' failed: {source}")]
    Delegation {
        agent: String,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Run cancelled")]
    Cancelled,

    /// A background worker ended without reporting a result.
    #[error("Agent worker stopped without reporting a result")]
    WorkerLost,
}

impl AgentError {
    /// The event class reported for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Provider(_) => ErrorClass::Transport,
            Self::Stream(_) => ErrorClass::Stream,
            Self::UnknownAgent(_) => ErrorClass::UnknownAgent,
            Self::Delegation { .. } => ErrorClass::Delegation,
            Self::Cancelled | Self::WorkerLost => ErrorClass::Cancelled,
        }
    }
}
