//! Tool System
//!
//! Tools come from external tool-servers. Their stable identity is
//! `{serverName}__{rawName}`, which keeps names unique across servers.
//! Adapters execute tools through the [`ToolExecutor`] seam and never talk
//! to servers directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::{CANCELLED_RESULT_TEXT, ContentBlock};

/// Separator between server name and raw tool name
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Default cap on human-readable result text
pub const DEFAULT_MAX_DISPLAY_CHARS: usize = 30_000;

/// Build the namespaced identity of a tool.
pub fn namespaced(server: &str, raw: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{raw}")
}

/// Split a namespaced name at the first separator.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
        .filter(|(server, raw)| !server.is_empty() && !raw.is_empty())
}

/// Longest tool name every backend accepts
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Raw tool names must be usable by every backend: ASCII letters, digits,
/// `_` and `-` only.
pub fn is_valid_raw_name(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Whether the namespaced name of `raw` on `server` fits every backend.
pub fn is_valid_tool_name(server: &str, raw: &str) -> bool {
    is_valid_raw_name(server)
        && is_valid_raw_name(raw)
        && server.len() + NAMESPACE_SEPARATOR.len() + raw.len() <= MAX_TOOL_NAME_LEN
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Namespaced identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// JSON-schema-like input document
    pub input_schema: serde_json::Value,

    /// Server that owns this tool
    pub server: String,
}

impl ToolSpec {
    pub fn new(
        server: &str,
        raw: &str,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: namespaced(server, raw),
            description: description.into(),
            input_schema,
            server: server.to_string(),
        }
    }

    /// Raw (un-namespaced) tool name
    pub fn raw_name(&self) -> &str {
        split_namespaced(&self.name).map_or(self.name.as_str(), |(_, raw)| raw)
    }
}

/// Outcome of one tool call, ready to be folded into a tool-result block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    /// Human-readable, possibly truncated or pretty-printed
    pub display_text: String,

    /// Machine-usable blocks (text and images)
    pub content_blocks: Vec<ContentBlock>,

    pub has_images: bool,

    #[serde(default)]
    pub is_error: bool,

    /// Execution was skipped or aborted
    #[serde(default)]
    pub cancelled: bool,
}

impl ToolExecutionResult {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            content_blocks: vec![ContentBlock::text(text.clone())],
            display_text: text,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = format!("Error: {}", message.into());
        Self {
            is_error: true,
            ..Self::text(message)
        }
    }

    /// Synthetic result for a call that never ran (or was force-stopped)
    pub fn cancelled(reason: Option<&str>) -> Self {
        let text = reason.map_or_else(|| CANCELLED_RESULT_TEXT.to_string(), ToString::to_string);
        Self {
            is_error: true,
            cancelled: true,
            ..Self::text(text)
        }
    }

    /// Build from server-returned blocks: JSON text is pretty-printed and the
    /// display text is truncated to `max_display_chars`.
    pub fn from_content(blocks: Vec<ContentBlock>, is_error: bool, max_display_chars: usize) -> Self {
        let mut content_blocks = Vec::with_capacity(blocks.len());
        let mut texts = Vec::new();

        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    let pretty = pretty_json(&text).unwrap_or(text);
                    texts.push(pretty.clone());
                    content_blocks.push(ContentBlock::Text { text: pretty });
                }
                ContentBlock::Image { .. } => {
                    texts.push("[image]".into());
                    content_blocks.push(block);
                }
                other => {
                    texts.push(other.plain_text());
                    content_blocks.push(other);
                }
            }
        }

        let mut display_text = texts.join("\n");
        if display_text.is_empty() {
            display_text = "(no output)".into();
        }
        if is_error && !display_text.starts_with("Error:") {
            display_text = format!("Error: {display_text}");
        }

        Self {
            display_text: truncate_display(display_text, max_display_chars),
            has_images: content_blocks.iter().any(ContentBlock::is_image),
            content_blocks,
            is_error,
            cancelled: false,
        }
    }

    /// Append injected text (e.g. from hooks) to both views of the result.
    pub fn append_note(&mut self, note: &str) {
        if note.is_empty() {
            return;
        }
        self.display_text.push_str("\n\n");
        self.display_text.push_str(note);
        self.content_blocks.push(ContentBlock::text(note));
    }

    /// Convert to a canonical tool-result block answering `tool_use_id`.
    pub fn to_block(&self, tool_use_id: &str) -> ContentBlock {
        let content = if self.content_blocks.is_empty() {
            vec![ContentBlock::text(self.display_text.clone())]
        } else {
            self.content_blocks.clone()
        };
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content,
            is_error: self.is_error,
        }
    }
}

fn pretty_json(text: &str) -> Option<String> {
    let trimmed = text.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    serde_json::to_string_pretty(&value).ok()
}

fn truncate_display(text: String, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}\n... [truncated {} characters]", count - max)
}

/// Callback through which adapters list and execute tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools exposed to the model
    async fn available_tools(&self) -> Vec<ToolSpec>;

    /// Execute a namespaced tool. Failures come back as error results, never
    /// as `Err`, so the model can reason about them.
    async fn execute(&self, name: &str, input: serde_json::Value) -> ToolExecutionResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespacing() {
        assert_eq!(namespaced("alpha", "search"), "alpha__search");
        assert_eq!(split_namespaced("alpha__search"), Some(("alpha", "search")));
        assert_eq!(split_namespaced("beta__find__all"), Some(("beta", "find__all")));
        assert_eq!(split_namespaced("search"), None);
    }

    #[test]
    fn test_tool_name_validity() {
        assert!(!is_valid_raw_name("ns:tool"));
        assert!(!is_valid_raw_name("read-file.v2"));
        assert!(is_valid_raw_name("read-file_v2"));

        assert!(is_valid_tool_name("files", "read"));
        assert!(!is_valid_tool_name("my.server", "read"));
        let raw = "r".repeat(MAX_TOOL_NAME_LEN - "files__".len());
        assert!(is_valid_tool_name("files", &raw));
        assert!(!is_valid_tool_name("files", &format!("{raw}x")));
    }

    #[test]
    fn test_result_pretty_prints_and_truncates() {
        let result = ToolExecutionResult::from_content(
            vec![ContentBlock::text(r#"{"a":1}"#)],
            false,
            DEFAULT_MAX_DISPLAY_CHARS,
        );
        assert_eq!(result.display_text, "{\n  \"a\": 1\n}");

        let long = ToolExecutionResult::from_content(vec![ContentBlock::text("x".repeat(50))], false, 10);
        assert!(long.display_text.starts_with("xxxxxxxxxx\n... [truncated 40"));
    }

    #[test]
    fn test_result_with_images_and_errors() {
        let result = ToolExecutionResult::from_content(
            vec![
                ContentBlock::text("boom"),
                ContentBlock::Image { media_type: "image/png".into(), data: "AAAA".into() },
            ],
            true,
            100,
        );
        assert!(result.has_images);
        assert!(result.is_error);
        assert_eq!(result.display_text, "Error: boom\n[image]");
    }
}
