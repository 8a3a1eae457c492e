//! Persisted enablement state.
//!
//! Tracks disabled servers and disabled (namespaced) tools across restarts.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use agent_core::tool::split_namespaced;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{McpError, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub disabled_tools: BTreeSet<String>,
    #[serde(default)]
    pub disabled_servers: BTreeSet<String>,
}

impl ToolState {
    pub fn is_tool_enabled(&self, server: &str, name: &str) -> bool {
        !self.disabled_servers.contains(server) && !self.disabled_tools.contains(name)
    }

    /// Drop entries naming tools that no longer exist. Entries belonging to
    /// `preserved` servers (e.g. ones that failed to refresh) are kept as-is.
    /// Returns whether anything was removed.
    pub fn prune(&mut self, known_tools: &BTreeSet<String>, preserved: &BTreeSet<String>) -> bool {
        let before = self.disabled_tools.len();
        self.disabled_tools.retain(|name| {
            known_tools.contains(name)
                || split_namespaced(name).is_some_and(|(server, _)| preserved.contains(server))
        });
        before != self.disabled_tools.len()
    }
}

/// Where enablement state lives between runs
pub trait ToolStateStore: Send + Sync {
    fn load(&self) -> Result<ToolState>;
    fn save(&self, state: &ToolState) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryToolStateStore {
    state: Mutex<ToolState>,
}

impl MemoryToolStateStore {
    pub fn new(state: ToolState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl ToolStateStore for MemoryToolStateStore {
    fn load(&self) -> Result<ToolState> {
        Ok(self
            .state
            .lock()
            .map_err(|_| McpError::Config("tool state lock poisoned".into()))?
            .clone())
    }

    fn save(&self, state: &ToolState) -> Result<()> {
        *self
            .state
            .lock()
            .map_err(|_| McpError::Config("tool state lock poisoned".into()))? = state.clone();
        Ok(())
    }
}

/// JSON file; a missing file is an empty state
#[derive(Clone, Debug)]
pub struct FileToolStateStore {
    path: PathBuf,
}

impl FileToolStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ToolStateStore for FileToolStateStore {
    fn load(&self) -> Result<ToolState> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No tool state file, starting empty");
                Ok(ToolState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &ToolState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }
}
