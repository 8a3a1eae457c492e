//! Context Window Management
//!
//! Tracks a running token count against the active model's context window
//! and compacts old history into a single summary message once a threshold
//! is crossed. Counts are estimates unless a backend reports exact figures.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::{ContentBlock, Conversation, Message, Role};
use crate::provider::{CompletionRequest, ProviderAdapter};

const SUMMARY_MAX_TOKENS: u32 = 2_048;

const SUMMARY_SYSTEM_PROMPT: &str = "You compress conversations between a user and a \
tool-using assistant. Write a concise summary that preserves the decisions made, the work \
already accomplished, open questions, and which tools were used and how. Reply with the \
summary only.";

/// Summarization settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSettings {
    pub enabled: bool,

    /// Percentage of the window at which compaction is due
    pub threshold_percent: u8,

    /// Most recent messages exempt from compaction
    pub keep_recent: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: 80,
            keep_recent: 6,
        }
    }
}

/// Result of one compaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Compaction {
    pub compacted_messages: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

/// Running token budget of one conversation
#[derive(Clone, Debug)]
pub struct ContextManager {
    settings: ContextSettings,
    context_window: u64,
    estimate: u64,
}

impl ContextManager {
    pub const fn new(settings: ContextSettings, context_window: u64) -> Self {
        Self {
            settings,
            context_window,
            estimate: 0,
        }
    }

    pub const fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub const fn context_window(&self) -> u64 {
        self.context_window
    }

    pub const fn set_context_window(&mut self, context_window: u64) {
        self.context_window = context_window;
    }

    /// `enabled AND current / window * 100 >= threshold`, in integer math.
    pub fn should_summarize(&self, current: u64) -> bool {
        if !self.settings.enabled || self.context_window == 0 {
            return false;
        }
        u128::from(current) * 100
            >= u128::from(self.settings.threshold_percent) * u128::from(self.context_window)
    }

    /// Current running estimate (or exact count after a resync)
    pub const fn estimate_tokens(&self) -> u64 {
        self.estimate
    }

    /// Replace the running count, e.g. with backend-reported usage
    pub const fn set_estimate(&mut self, tokens: u64) {
        self.estimate = tokens;
    }

    pub const fn add_estimate(&mut self, tokens: u64) {
        self.estimate = self.estimate.saturating_add(tokens);
    }

    /// Re-estimate from scratch
    pub fn recount(&mut self, conversation: &Conversation) {
        self.estimate = conversation.estimate_tokens();
    }

    /// Adopt an exact count from the backend
    pub fn resync(&mut self, exact: u64) {
        if exact != self.estimate {
            tracing::debug!(estimate = self.estimate, exact, "Resynchronized token count");
        }
        self.estimate = exact;
    }

    /// Index splitting `messages` into compacted prefix and kept suffix.
    /// The kept suffix never starts with a tool message, since that result
    /// would lose its invocation.
    fn split_point(&self, messages: &[Message]) -> usize {
        if messages.len() <= self.settings.keep_recent {
            return 0;
        }
        let mut split = messages.len() - self.settings.keep_recent;
        while split > 0 && messages[split].role == Role::Tool {
            split -= 1;
        }
        split
    }

    /// Replace everything but the most recent messages with one synthetic
    /// summary produced by `adapter`. Returns `None` when there is nothing
    /// to compact. On failure the conversation is left untouched.
    pub async fn summarize(
        &mut self,
        conversation: &mut Conversation,
        adapter: &dyn ProviderAdapter,
        model: &str,
    ) -> Result<Option<Compaction>> {
        let split = self.split_point(conversation.messages());
        if split == 0 {
            return Ok(None);
        }

        let compacted = &conversation.messages()[..split];
        let request = CompletionRequest {
            messages: vec![Message::user(render_transcript(compacted))],
            model: model.to_string(),
            system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            max_output_tokens: SUMMARY_MAX_TOKENS,
        };
        let text = adapter
            .complete(request)
            .await
            .map_err(|e| AgentError::Summarization(e.to_string()))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::Summarization("backend returned an empty summary".into()));
        }

        let removed: u64 = compacted.iter().map(Message::estimate_tokens).sum();
        let summary = Message::user(format!("[Previous conversation summary: {text}]")).synthetic();
        let added = summary.estimate_tokens();

        conversation.replace_prefix(split, summary);
        let tokens_before = self.estimate;
        self.estimate = self.estimate.saturating_sub(removed) + added;

        tracing::info!(
            compacted = split,
            kept = conversation.len() - 1,
            tokens_before,
            tokens_after = self.estimate,
            "Compacted conversation history"
        );

        Ok(Some(Compaction {
            compacted_messages: split,
            tokens_before,
            tokens_after: self.estimate,
        }))
    }
}

/// Flatten messages into a plain transcript for the summarizer, so the
/// request carries no tool-pairing constraints of its own.
fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::from("Summarize the following conversation.\n\n");
    for message in messages {
        let text = message.text();
        if !text.is_empty() {
            let _ = writeln!(out, "{}: {text}", message.role);
        }
        for block in &message.blocks {
            match block {
                ContentBlock::ToolUse { name, input, .. } => {
                    let _ = writeln!(out, "{} called tool {name} with {input}", message.role);
                }
                ContentBlock::ToolResult { .. } if text.is_empty() => {
                    let _ = writeln!(out, "tool result: {}", block.plain_text());
                }
                _ => {}
            }
        }
    }
    out
}
