//! Conversation Messages
//!
//! Canonical, backend-agnostic message format. Every provider adapter
//! translates from this shape into its own wire format and never exposes
//! native types past its boundary.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rough cost of an image or document block when estimating tokens.
const ATTACHMENT_TOKEN_ESTIMATE: u64 = 1_500;

/// Text inserted for invocations that never received a result.
pub const CANCELLED_RESULT_TEXT: &str = "Tool execution cancelled";

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User input (including synthetic reminders and summaries)
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool results
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Typed content block inside a message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64 payload
        data: String,
    },
    Document {
        media_type: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Self::text(text)],
            is_error: false,
        }
    }

    /// Synthetic result for an invocation that was never executed.
    pub fn cancelled_result(tool_use_id: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Self::text(CANCELLED_RESULT_TEXT)],
            is_error: true,
        }
    }

    pub const fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }

    /// Concatenated text of this block (tool results flatten their content).
    pub fn plain_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ToolResult { content, .. } => content
                .iter()
                .map(Self::plain_text)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Thinking { thinking, .. } => thinking.clone(),
            _ => String::new(),
        }
    }

    fn estimate_tokens(&self) -> u64 {
        match self {
            Self::Text { text } => chars_to_tokens(text),
            Self::Thinking { thinking, .. } => chars_to_tokens(thinking),
            Self::Image { .. } | Self::Document { .. } => ATTACHMENT_TOKEN_ESTIMATE,
            Self::ToolUse { name, input, .. } => {
                chars_to_tokens(name) + chars_to_tokens(&input.to_string())
            }
            Self::ToolResult { content, .. } => content.iter().map(Self::estimate_tokens).sum(),
        }
    }
}

fn chars_to_tokens(text: &str) -> u64 {
    // ~4 characters per token is a rough estimate
    (text.len() / 4) as u64
}

/// Additional message metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Message was generated by the client (summary, reminder, briefing, notice)
    #[serde(default)]
    pub synthetic: bool,

    /// Model that generated this (for assistant messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Plain-text content
    pub content: String,

    /// Ordered typed content blocks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<ContentBlock>,

    /// For positionally paired tool messages: the invocation this answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            blocks: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message from typed blocks; `content` is the
    /// concatenation of its text blocks.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        let content = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        Self::new(Role::Assistant, content).with_blocks(blocks)
    }

    /// Tool message carrying one or more id-keyed results
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        let content = results
            .iter()
            .map(ContentBlock::plain_text)
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(Role::Tool, content).with_blocks(results)
    }

    /// Tool message answering exactly one invocation (positional pairing)
    pub fn tool_result_for(tool_call_id: impl Into<String>, result: ContentBlock) -> Self {
        let mut message = Self::tool_results(vec![result]);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn with_blocks(mut self, blocks: Vec<ContentBlock>) -> Self {
        self.blocks.extend(blocks);
        self
    }

    pub fn synthetic(mut self) -> Self {
        self.metadata.synthetic = true;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }

    /// Text shown to the model: the plain content, or the text blocks when
    /// content is empty.
    pub fn text(&self) -> String {
        if !self.content.is_empty() {
            return self.content.clone();
        }
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Reasoning text carried by this message, if any
    pub fn reasoning(&self) -> Option<String> {
        let text: String = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { thinking, .. } => Some(thinking.as_str()),
                _ => None,
            })
            .collect();
        (!text.is_empty()).then_some(text)
    }

    /// Ids of tool invocations requested by this message
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids of invocations answered by this message
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_uses(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn is_synthetic(&self) -> bool {
        self.metadata.synthetic
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u64 {
        let blocks: u64 = self.blocks.iter().map(ContentBlock::estimate_tokens).sum();
        let has_text_block = self
            .blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::Text { .. } | ContentBlock::ToolResult { .. }));
        let content = if has_text_block {
            0
        } else {
            chars_to_tokens(&self.content)
        };
        content + blocks + 4 // +4 for role overhead
    }
}

/// How a backend pairs tool results with the invocations that requested them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultPairing {
    /// One sibling tool message lists `{call-id, content}` entries
    ById,
    /// Each result must directly follow the assistant message that asked for it
    ByPosition,
}

/// Append-only conversation log; compaction is the only prefix rewrite.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Estimate total tokens in conversation
    pub fn estimate_tokens(&self) -> u64 {
        self.messages.iter().map(Message::estimate_tokens).sum()
    }

    /// Atomically replace the first `count` messages with `replacement`.
    pub fn replace_prefix(&mut self, count: usize, replacement: Message) {
        let count = count.min(self.messages.len());
        self.messages.splice(..count, std::iter::once(replacement));
    }

    /// Invocation ids that have no result anywhere after them.
    pub fn unresolved_tool_uses(&self) -> Vec<String> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(Message::tool_result_ids)
            .collect();
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(Message::tool_use_ids)
            .filter(|id| !answered.contains(id))
            .map(ToString::to_string)
            .collect()
    }

    /// Drop result blocks whose invocation id does not appear in a strictly
    /// preceding assistant message; tool messages left empty are removed.
    /// Returns the number of dropped results.
    pub fn prune_orphan_results(&mut self) -> usize {
        let mut seen: HashSet<String> = HashSet::new();
        let mut dropped = 0;
        let mut kept = Vec::with_capacity(self.messages.len());

        for mut message in self.messages.drain(..) {
            match message.role {
                Role::Assistant => {
                    seen.extend(message.tool_use_ids().into_iter().map(ToString::to_string));
                    kept.push(message);
                }
                Role::Tool => {
                    let before = message.blocks.len();
                    message.blocks.retain(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => seen.contains(tool_use_id),
                        _ => true,
                    });
                    let removed = before - message.blocks.len();
                    dropped += removed;
                    if message.tool_result_ids().is_empty() {
                        continue;
                    }
                    if removed > 0 {
                        message.content = message
                            .blocks
                            .iter()
                            .map(ContentBlock::plain_text)
                            .collect::<Vec<_>>()
                            .join("\n");
                    }
                    kept.push(message);
                }
                Role::User => kept.push(message),
            }
        }

        self.messages = kept;
        if dropped > 0 {
            tracing::warn!(dropped, "Dropped orphaned tool results");
        }
        dropped
    }

    /// Attach id-keyed results as one sibling tool message. Results whose id
    /// is not an unresolved invocation are dropped. Returns how many were kept.
    pub fn attach_results_by_id(&mut self, results: Vec<ContentBlock>) -> usize {
        let unresolved: HashSet<String> = self.unresolved_tool_uses().into_iter().collect();
        let results: Vec<ContentBlock> = results
            .into_iter()
            .filter(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    let known = unresolved.contains(tool_use_id);
                    if !known {
                        tracing::warn!(id = %tool_use_id, "Dropping orphaned tool result");
                    }
                    known
                }
                _ => false,
            })
            .collect();
        let kept = results.len();
        if kept > 0 {
            self.messages.push(Message::tool_results(results));
        }
        kept
    }

    /// Insert a result directly after the assistant message that requested
    /// it (after any results already attached there). The owner is found by
    /// scanning backward for the nearest assistant message with unresolved
    /// ids; ids are matched strictly. Returns false for orphans.
    pub fn attach_result_by_position(&mut self, result: ContentBlock) -> bool {
        let ContentBlock::ToolResult { tool_use_id, .. } = &result else {
            return false;
        };
        let unresolved: HashSet<String> = self.unresolved_tool_uses().into_iter().collect();
        if !unresolved.contains(tool_use_id) {
            tracing::warn!(id = %tool_use_id, "Dropping orphaned tool result");
            return false;
        }

        let owner = self.messages.iter().rposition(|m| {
            m.role == Role::Assistant && m.tool_use_ids().iter().any(|id| *id == tool_use_id.as_str())
        });
        let Some(owner) = owner else {
            return false;
        };

        let mut insert_at = owner + 1;
        while insert_at < self.messages.len() && self.messages[insert_at].role == Role::Tool {
            insert_at += 1;
        }
        let id = tool_use_id.clone();
        self.messages
            .insert(insert_at, Message::tool_result_for(id, result));
        true
    }

    /// Safety pass: give every dangling invocation a synthetic cancelled
    /// result so the history can be sent to backends that reject
    /// unresolved tool calls. Returns the number of inserted results.
    pub fn resolve_dangling(&mut self, pairing: ToolResultPairing) -> usize {
        let dangling = self.unresolved_tool_uses();
        if dangling.is_empty() {
            return 0;
        }
        tracing::debug!(count = dangling.len(), "Resolving dangling tool invocations");
        match pairing {
            ToolResultPairing::ById => {
                // Group per owning assistant message so each sibling message
                // follows its own invocations.
                let mut index = 0;
                while index < self.messages.len() {
                    let ids: Vec<String> = if self.messages[index].role == Role::Assistant {
                        self.messages[index]
                            .tool_use_ids()
                            .into_iter()
                            .filter(|id| dangling.iter().any(|d| d.as_str() == *id))
                            .map(ToString::to_string)
                            .collect()
                    } else {
                        Vec::new()
                    };
                    if ids.is_empty() {
                        index += 1;
                        continue;
                    }
                    let mut insert_at = index + 1;
                    while insert_at < self.messages.len()
                        && self.messages[insert_at].role == Role::Tool
                    {
                        insert_at += 1;
                    }
                    let blocks = ids.into_iter().map(ContentBlock::cancelled_result).collect();
                    self.messages
                        .insert(insert_at, Message::tool_results(blocks).synthetic());
                    index = insert_at + 1;
                }
            }
            ToolResultPairing::ByPosition => {
                for id in &dangling {
                    self.attach_result_by_position(ContentBlock::cancelled_result(id.clone()));
                }
            }
        }
        dangling.len()
    }
}
