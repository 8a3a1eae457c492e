//! JSON-RPC 2.0 framing and tool-server payloads.
//!
//! Messages are newline-delimited JSON over the child's stdio.

use agent_core::message::ContentBlock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub const fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    pub const fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Anything a server may write on its stdout
#[derive(Debug, PartialEq)]
pub enum Incoming {
    Response(JsonRpcResponse),
    Notification { method: String, params: Option<Value> },
    /// Server-to-client request; must be answered
    Request { id: Value, method: String },
}

impl Incoming {
    /// Classify one line. Returns `None` for non-JSON noise.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let method = value.get("method").and_then(Value::as_str).map(ToString::to_string);
        let id = value.get("id").filter(|id| !id.is_null()).cloned();

        match (method, id) {
            (Some(method), Some(id)) => Some(Self::Request { id, method }),
            (Some(method), None) => Some(Self::Notification {
                method,
                params: value.get("params").cloned(),
            }),
            (None, Some(_)) => serde_json::from_value(value).ok().map(Self::Response),
            (None, None) => None,
        }
    }
}

/// One content item of a tool result or prompt message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unsupported,
}

impl RemoteContent {
    /// Canonical block; embedded resources become their text or JSON.
    pub fn into_block(self) -> Option<ContentBlock> {
        match self {
            Self::Text { text } => Some(ContentBlock::text(text)),
            Self::Image { data, mime_type } => Some(ContentBlock::Image {
                media_type: mime_type,
                data,
            }),
            Self::Resource { resource } => {
                let text = resource
                    .get("text")
                    .and_then(Value::as_str)
                    .map_or_else(|| resource.to_string(), ToString::to_string);
                Some(ContentBlock::text(text))
            }
            Self::Unsupported => None,
        }
    }
}

/// A tool as advertised by a server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Clone, Debug, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemotePrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PromptsListResult {
    #[serde(default)]
    pub prompts: Vec<RemotePrompt>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: RemoteContent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<RemoteContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![RemoteContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn into_blocks(self) -> Vec<ContentBlock> {
        self.content
            .into_iter()
            .filter_map(RemoteContent::into_block)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_incoming() {
        let response = Incoming::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#);
        assert!(matches!(response, Some(Incoming::Response(r)) if r.id == 3));

        let note = Incoming::parse(r#"{"jsonrpc":"2.0","method":"notifications/message"}"#);
        assert!(matches!(note, Some(Incoming::Notification { method, .. }) if method == "notifications/message"));

        let ping = Incoming::parse(r#"{"jsonrpc":"2.0","id":"s1","method":"ping"}"#);
        assert!(matches!(ping, Some(Incoming::Request { method, .. }) if method == "ping"));

        assert_eq!(Incoming::parse("starting server..."), None);
    }

    #[test]
    fn test_call_result_blocks() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "audio", "data": "x"}
            ],
            "isError": false
        }"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        let blocks = result.into_blocks();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].is_image());
    }
}
