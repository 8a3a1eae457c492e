//! Server Registry
//!
//! Owns the connections to every configured tool-server and their catalogs.
//! Servers connect independently: one failing never aborts the batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use agent_core::tool::{ToolSpec, split_namespaced};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::{Connector, ToolServerClient};
use crate::config::{McpConfig, ServerSpec};
use crate::connection::ServerConnection;
use crate::error::{McpError, Result};
use crate::protocol::{GetPromptResult, RemotePrompt};
use crate::tool_state::{MemoryToolStateStore, ToolState, ToolStateStore};

/// Catalog returned by a successful connect
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<RemotePrompt>,
}

impl From<&ServerConnection> for Catalog {
    fn from(connection: &ServerConnection) -> Self {
        Self {
            tools: connection.tools.clone(),
            prompts: connection.prompts.clone(),
        }
    }
}

/// Outcome of a batch connect or refresh
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    /// Server name and reason
    pub failed: Vec<(String, String)>,
}

impl ConnectReport {
    fn failed_names(&self) -> BTreeSet<String> {
        self.failed.iter().map(|(name, _)| name.clone()).collect()
    }
}

pub struct ServerRegistry {
    connector: Arc<dyn Connector>,
    connections: RwLock<BTreeMap<String, ServerConnection>>,
    specs: RwLock<BTreeMap<String, ServerSpec>>,
    state: RwLock<ToolState>,
    store: Arc<dyn ToolStateStore>,
}

impl ServerRegistry {
    /// Registry with in-memory enablement state
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(BTreeMap::new()),
            specs: RwLock::new(BTreeMap::new()),
            state: RwLock::new(ToolState::default()),
            store: Arc::new(MemoryToolStateStore::default()),
        }
    }

    /// Registry whose enablement state is loaded from and saved to `store`
    pub fn with_state_store(connector: Arc<dyn Connector>, store: Arc<dyn ToolStateStore>) -> Result<Self> {
        let state = store.load()?;
        Ok(Self {
            state: RwLock::new(state),
            store,
            ..Self::new(connector)
        })
    }

    /// Connect one server, replacing any existing connection of that name.
    pub async fn connect(&self, name: &str, spec: &ServerSpec) -> Result<Catalog> {
        self.specs.write().await.insert(name.to_string(), spec.clone());

        let connection = ServerConnection::establish(self.connector.as_ref(), name, spec).await?;
        let catalog = Catalog::from(&connection);
        info!(
            server = name,
            tools = catalog.tools.len(),
            prompts = catalog.prompts.len(),
            "Tool-server connected"
        );

        let previous = self.connections.write().await.insert(name.to_string(), connection);
        if let Some(previous) = previous {
            close_quietly(&previous).await;
        }
        Ok(catalog)
    }

    /// Connect every enabled server concurrently. Fails only when servers
    /// were configured and none of them connected.
    pub async fn connect_all(&self, config: &McpConfig) -> Result<ConnectReport> {
        let attempts = config.enabled_servers().map(|(name, spec)| async move {
            (name.clone(), self.connect(name, spec).await)
        });

        let mut report = ConnectReport::default();
        for (name, outcome) in join_all(attempts).await {
            match outcome {
                Ok(_) => report.connected.push(name),
                Err(e) => {
                    warn!(server = %name, error = %e, "Tool-server failed to connect");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        if report.connected.is_empty() && !report.failed.is_empty() {
            let reasons: Vec<String> = report
                .failed
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect();
            return Err(McpError::NoServersConnected(reasons.join("; ")));
        }

        self.prune_state(&report.failed_names()).await?;
        Ok(report)
    }

    /// Close and forget one server. Close-time errors are swallowed.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let connection = self
            .connections
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        close_quietly(&connection).await;
        info!(server = name, "Tool-server disconnected");
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let connections = std::mem::take(&mut *self.connections.write().await);
        join_all(connections.values().map(close_quietly)).await;
    }

    /// Tear down and re-spawn one server, leaving every other server alone.
    pub async fn reconnect(&self, name: &str) -> Result<Catalog> {
        let spec = self
            .specs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        let old = self.connections.write().await.remove(name);
        if let Some(old) = old {
            close_quietly(&old).await;
        }

        info!(server = name, "Reconnecting tool-server");
        self.connect(name, &spec).await
    }

    async fn client(&self, name: &str) -> Result<Arc<dyn ToolServerClient>> {
        self.connections
            .read()
            .await
            .get(name)
            .map(|c| Arc::clone(&c.client))
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    /// Fresh tool listing from one server. Errors other than connection
    /// failures yield an empty list.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolSpec>> {
        let mut connection = self
            .connection(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        connection.load_catalogs().await?;
        Ok(connection.tools)
    }

    pub async fn list_prompts(&self, name: &str) -> Result<Vec<RemotePrompt>> {
        match self.client(name).await?.list_prompts().await {
            Ok(prompts) => Ok(prompts),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => {
                debug!(server = name, error = %e, "Prompts unavailable");
                Ok(Vec::new())
            }
        }
    }

    /// An unsupported prompts method yields an empty prompt.
    pub async fn get_prompt(&self, server: &str, prompt: &str, arguments: Value) -> Result<GetPromptResult> {
        match self.client(server).await?.get_prompt(prompt, arguments).await {
            Err(e) if e.is_method_not_found() => Ok(GetPromptResult::default()),
            other => other,
        }
    }

    /// Re-read every connected server's catalogs and prune enablement
    /// entries for tools that disappeared. A server whose listing fails,
    /// including timeouts, keeps its previous catalog and state.
    pub async fn refresh_catalogs(&self) -> Result<ConnectReport> {
        let snapshot: Vec<ServerConnection> = self.connections.read().await.values().cloned().collect();

        let refreshed = join_all(snapshot.into_iter().map(|mut connection| async move {
            let outcome = connection.refresh().await;
            (connection, outcome)
        }))
        .await;

        let mut report = ConnectReport::default();
        {
            let mut connections = self.connections.write().await;
            for (connection, outcome) in refreshed {
                match outcome {
                    Ok(()) => {
                        report.connected.push(connection.name.clone());
                        if connections.contains_key(&connection.name) {
                            connections.insert(connection.name.clone(), connection);
                        }
                    }
                    Err(e) => {
                        warn!(server = %connection.name, error = %e, "Catalog refresh failed");
                        report.failed.push((connection.name, e.to_string()));
                    }
                }
            }
        }

        self.prune_state(&report.failed_names()).await?;
        Ok(report)
    }

    /// Drop disabled-tool entries no connected catalog mentions. Tools of
    /// servers that are not connected, or whose refresh failed, are kept.
    async fn prune_state(&self, failed: &BTreeSet<String>) -> Result<()> {
        let (known, connected): (BTreeSet<String>, BTreeSet<String>) = {
            let connections = self.connections.read().await;
            let known = connections
                .values()
                .flat_map(|c| c.tools.iter().map(|t| t.name.clone()))
                .collect();
            (known, connections.keys().cloned().collect())
        };

        let mut state = self.state.write().await;
        let preserved: BTreeSet<String> = state
            .disabled_tools
            .iter()
            .filter_map(|name| split_namespaced(name).map(|(server, _)| server.to_string()))
            .filter(|server| !connected.contains(server) || failed.contains(server))
            .collect();

        if state.prune(&known, &preserved) {
            debug!("Pruned stale tool enablement entries");
            self.store.save(&state)?;
        }
        Ok(())
    }

    /// Hide or expose a server's tools to the agent. The server stays
    /// connected and directly invokable either way.
    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let known = self.connections.read().await.contains_key(name) || self.specs.read().await.contains_key(name);
        if !known {
            return Err(McpError::ServerNotFound(name.to_string()));
        }

        let mut state = self.state.write().await;
        if enabled {
            state.disabled_servers.remove(name);
        } else {
            state.disabled_servers.insert(name.to_string());
        }
        self.store.save(&state)
    }

    pub async fn set_tool_enabled(&self, tool: &str, enabled: bool) -> Result<()> {
        let exists = self
            .connections
            .read()
            .await
            .values()
            .any(|c| c.tools.iter().any(|t| t.name == tool));
        if !exists {
            return Err(McpError::ToolNotFound(tool.to_string()));
        }

        let mut state = self.state.write().await;
        if enabled {
            state.disabled_tools.remove(tool);
        } else {
            state.disabled_tools.insert(tool.to_string());
        }
        self.store.save(&state)
    }

    pub async fn tool_state(&self) -> ToolState {
        self.state.read().await.clone()
    }

    /// Tools exposed to the model: connected, enabled servers and tools only
    pub async fn agent_tools(&self) -> Vec<ToolSpec> {
        let state = self.state.read().await;
        self.connections
            .read()
            .await
            .values()
            .flat_map(|c| c.tools.iter())
            .filter(|tool| state.is_tool_enabled(&tool.server, &tool.name))
            .cloned()
            .collect()
    }

    /// Prompts exposed to the model, keyed by server
    pub async fn agent_prompts(&self) -> Vec<(String, RemotePrompt)> {
        let state = self.state.read().await;
        self.connections
            .read()
            .await
            .values()
            .filter(|c| !state.disabled_servers.contains(&c.name))
            .flat_map(|c| c.prompts.iter().map(|p| (c.name.clone(), p.clone())))
            .collect()
    }

    /// Fetch a prompt the agent may use; prompts of disabled servers are
    /// refused.
    pub async fn agent_prompt(&self, server: &str, prompt: &str, arguments: Value) -> Result<GetPromptResult> {
        let exposed = self
            .agent_prompts()
            .await
            .iter()
            .any(|(s, p)| s == server && p.name == prompt);
        if !exposed {
            return Err(McpError::PromptNotFound(format!("{server}/{prompt}")));
        }
        self.get_prompt(server, prompt, arguments).await
    }

    /// Every connected tool, enabled or not
    pub async fn all_tools(&self) -> Vec<ToolSpec> {
        self.connections
            .read()
            .await
            .values()
            .flat_map(|c| c.tools.iter().cloned())
            .collect()
    }

    pub async fn connection(&self, name: &str) -> Option<ServerConnection> {
        self.connections.read().await.get(name).cloned()
    }

    /// First connected server (in name order) offering `raw`
    pub async fn find_by_raw_name(&self, raw: &str) -> Option<ServerConnection> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.find_tool(raw).is_some())
            .cloned()
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

async fn close_quietly(connection: &ServerConnection) {
    if let Err(e) = connection.client.close().await {
        debug!(server = %connection.name, error = %e, "Ignoring close error");
    }
}
