//! Collaborators
//!
//! The chat log records the conversation in causal order; the observer is a
//! purely additive live feed for display. Neither feeds back into the loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::TokenUsage;
use crate::message::Message;
use crate::tool::ToolExecutionResult;

/// One executed (or skipped) tool call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub result: ToolExecutionResult,
    /// Routed in from an external process through the listener
    #[serde(default)]
    pub external: bool,
    /// Invoked by a pre/post hook rather than the model
    #[serde(default)]
    pub from_hook: bool,
    pub timestamp: DateTime<Utc>,
}

impl ToolExecutionRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
        result: ToolExecutionResult,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            result,
            external: false,
            from_hook: false,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub const fn external(mut self) -> Self {
        self.external = true;
        self
    }

    #[must_use]
    pub const fn from_hook(mut self) -> Self {
        self.from_hook = true;
        self
    }
}

/// Receives conversation entries. Tool executions may arrive before the
/// assistant text of the same turn is committed.
pub trait ChatLog: Send + Sync {
    fn user_message_added(&self, message: &Message);
    fn assistant_message_added(&self, message: &Message);
    fn tool_execution_added(&self, record: &ToolExecutionRecord);
    fn token_usage(&self, usage: &TokenUsage);
}

/// Live notification for display
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolStart { name: String, external: bool },
    ToolComplete { name: String, display_text: String, is_error: bool, external: bool },
    TokenUsage { usage: TokenUsage },
    Warning { message: String },
    Done,
    Error { message: String },
}

pub trait Observer: Send + Sync {
    fn notify(&self, event: &ObserverEvent);
}

/// Drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl ChatLog for Discard {
    fn user_message_added(&self, _: &Message) {}
    fn assistant_message_added(&self, _: &Message) {}
    fn tool_execution_added(&self, _: &ToolExecutionRecord) {}
    fn token_usage(&self, _: &TokenUsage) {}
}

impl Observer for Discard {
    fn notify(&self, _: &ObserverEvent) {}
}

/// The external collaborators of one agent
#[derive(Clone)]
pub struct Collaborators {
    pub chat_log: Arc<dyn ChatLog>,
    pub observer: Arc<dyn Observer>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            chat_log: Arc::new(Discard),
            observer: Arc::new(Discard),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
