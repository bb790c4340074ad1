//! Per-conversation state.

use agentrelay_core::message::{Message, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The history and iteration counter a run extends.
///
/// A session has exactly one writer at a time: blocking runs borrow it
/// mutably, streaming runs move it into the worker and hand it back. It is
/// never rolled back; a failed run leaves its partial transcript in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    history: Vec<Message>,
    iterations: u32,
}

impl Session {
    /// A fresh session whose first message is the system prompt.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            history: vec![Message::system(system_prompt)],
            iterations: 0,
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Backend calls made by the current (or last) run.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn last(&self) -> Option<&Message> {
        self.history.last()
    }

    /// The system prompt this session was seeded with.
    pub fn system_prompt(&self) -> Option<&str> {
        self.history
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.history.push(message);
    }

    pub(crate) fn reset_iterations(&mut self) {
        self.iterations = 0;
    }

    /// Count one more backend call; returns the new count.
    pub(crate) fn next_iteration(&mut self) -> u32 {
        self.iterations += 1;
        self.iterations
    }
}
