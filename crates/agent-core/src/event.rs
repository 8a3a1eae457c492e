//! Canonical Stream Events
//!
//! The one event vocabulary every provider adapter emits, whatever its
//! native wire format. Adapters translate native payloads into these
//! variants and nothing native crosses this boundary.

use serde::{Deserialize, Serialize};

use crate::message::ContentBlock;
use crate::tool::ToolExecutionResult;

/// Kind of content block being opened
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockStart {
    Text,
    Thinking,
    ToolUse { name: String },
}

/// Incremental fragment of an open block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    /// Opaque signature that must travel back with a reasoning block
    ThinkingSignature(String),
    /// Partial tool-argument JSON
    ToolInputJson(String),
}

/// Token accounting reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Input already includes all prior history, so this is the context size.
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens + self.output_tokens
    }
}

/// Canonical event emitted by a provider adapter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A backend round-trip started
    MessageStart { model: Option<String> },

    ContentBlockStart { id: String, block: BlockStart },

    ContentBlockDelta { id: String, delta: BlockDelta },

    /// A requested tool ran (or was skipped); `id` is the invocation block id
    ToolUseComplete {
        id: String,
        name: String,
        input: serde_json::Value,
        result: ToolExecutionResult,
    },

    TokenUsage(TokenUsage),

    /// The round-trip finished; the accumulated assistant turn is final
    MessageStop { stop_reason: Option<String> },

    /// Authoritative assistant turn from backends that answer atomically
    CompleteResponse { blocks: Vec<ContentBlock> },

    /// Advisory text generated by the adapter itself
    ClientInfo { message: String },

    MaxIterationsReached { iterations: usize },

    /// Terminal backend failure
    Error { message: String },
}

impl StreamEvent {
    pub fn text_delta(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ContentBlockDelta {
            id: id.into(),
            delta: BlockDelta::Text(text.into()),
        }
    }

    pub fn client_info(message: impl Into<String>) -> Self {
        Self::ClientInfo {
            message: message.into(),
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = StreamEvent::text_delta("b1", "hi");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_block_delta");
        assert_eq!(json["delta"]["kind"], "text");
        assert_eq!(json["delta"]["value"], "hi");
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_tokens: 5,
            cache_write_tokens: 0,
        };
        assert_eq!(usage.total(), 125);
    }
}
