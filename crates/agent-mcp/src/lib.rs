//! # agent-mcp
//!
//! Connections to external tool-servers and the dispatcher that executes
//! their tools on the agent's behalf.
//!
//! ```text
//! ToolDispatcher ──► ServerRegistry ──► ServerConnection ──► ToolServerClient
//!  (approval,         (catalogs,          (one per server)     (stdio JSON-RPC)
//!   hooks, timeout)    enablement)
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod registry;
pub mod tool_state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{Connector, ToolServerClient};
pub use config::{McpConfig, ServerSpec};
pub use connection::ServerConnection;
pub use dispatcher::{DispatcherConfig, ToolDispatcher};
pub use error::{McpError, Result};
pub use hooks::{HookContext, HookSet, HookToolInvoker, PreHookOutcome, ToolHook, ToolMatcher};
pub use registry::{Catalog, ConnectReport, ServerRegistry};
pub use tool_state::{FileToolStateStore, MemoryToolStateStore, ToolState, ToolStateStore};
pub use transport::{ROUTER_URL_ENV, StdioClient, StdioConnector};
