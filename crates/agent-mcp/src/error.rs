//! Error Types

use agent_core::AgentError;
use thiserror::Error;

/// Result type alias for tool-server operations
pub type Result<T> = std::result::Result<T, McpError>;

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Tool-server error types
#[derive(Error, Debug)]
pub enum McpError {
    /// Channel to the child process failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Spawn or handshake failed
    #[error("Connection to '{server}' failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool not found in any server: {0}")]
    ToolNotFound(String),

    /// Unknown prompt, or one whose server is hidden from the agent
    #[error("Prompt not available: {0}")]
    PromptNotFound(String),

    /// JSON-RPC error object returned by the server
    #[error("Server error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Request '{0}' timed out")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Every configured server failed to connect
    #[error("No tool-server could be connected: {0}")]
    NoServersConnected(String),
}

impl McpError {
    /// Server does not implement the method (e.g. prompts)
    pub const fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Protocol { code, .. } if *code == METHOD_NOT_FOUND)
    }

    /// The connection itself is broken, as opposed to one request failing
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ConnectionFailed { .. } | Self::Io(_)
        )
    }
}

impl From<McpError> for AgentError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::ToolNotFound(name) => Self::ToolNotFound(name),
            McpError::Config(msg) => Self::Config(msg),
            McpError::Io(e) => Self::Io(e),
            McpError::Json(e) => Self::Json(e),
            other => Self::ToolExecution(other.to_string()),
        }
    }
}
