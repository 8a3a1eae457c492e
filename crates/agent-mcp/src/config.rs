//! Tool-server configuration.
//!
//! Uses the common `mcpServers` JSON shape:
//!
//! ```json
//! { "mcpServers": { "files": { "command": "files-server", "args": ["--root", "."] } } }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_core::tool::NAMESPACE_SEPARATOR;
use serde::{Deserialize, Serialize};

use crate::error::{McpError, Result};

/// How to spawn one tool-server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Configured but not started by `connect_all`
    #[serde(default)]
    pub disabled: bool,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_timeout_ms() -> u64 {
    60_000
}

impl ServerSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            disabled: false,
            timeout_ms: default_timeout_ms(),
        }
    }

    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Root configuration: server name to spec
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerSpec>,
}

impl McpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-server convenience: a one-element list
    pub fn single(name: impl Into<String>, spec: ServerSpec) -> Self {
        Self::new().with_server(name, spec)
    }

    /// Load config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate config from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| McpError::Config(format!("Invalid server config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_server(mut self, name: impl Into<String>, spec: ServerSpec) -> Self {
        self.servers.insert(name.into(), spec);
        self
    }

    /// Server names must not contain the namespace separator, or tool
    /// identities would become ambiguous.
    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.servers {
            if name.is_empty() || name.contains(NAMESPACE_SEPARATOR) {
                return Err(McpError::Config(format!(
                    "Invalid server name '{name}': must be non-empty and must not contain '{NAMESPACE_SEPARATOR}'"
                )));
            }
            if spec.command.trim().is_empty() {
                return Err(McpError::Config(format!("Server '{name}' has no command")));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.get(name)
    }

    /// Servers `connect_all` should start
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerSpec)> {
        self.servers.iter().filter(|(_, spec)| !spec.disabled)
    }
}
