//! Client seams
//!
//! The registry never spawns processes itself; it asks a [`Connector`] for a
//! live [`ToolServerClient`]. Production uses the stdio transport, tests use
//! in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ServerSpec;
use crate::error::Result;
use crate::protocol::{CallToolResult, GetPromptResult, RemotePrompt, RemoteTool};

/// One connected tool-server
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    /// Full tool catalog, following pagination
    async fn list_tools(&self) -> Result<Vec<RemoteTool>>;

    /// Call a tool by its raw name. No transport timeout is applied here.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;

    async fn list_prompts(&self) -> Result<Vec<RemotePrompt>>;

    async fn get_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult>;

    /// Shut the server down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Spawns and handshakes a server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServerClient>>;
}
