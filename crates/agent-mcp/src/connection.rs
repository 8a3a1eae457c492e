//! A connected server and its catalogs.

use std::sync::Arc;

use agent_core::tool::{ToolSpec, is_valid_tool_name};
use tracing::{debug, warn};

use crate::client::{Connector, ToolServerClient};
use crate::config::ServerSpec;
use crate::error::Result;
use crate::protocol::{RemotePrompt, RemoteTool};

#[derive(Clone)]
pub struct ServerConnection {
    pub name: String,
    pub spec: ServerSpec,
    pub client: Arc<dyn ToolServerClient>,
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<RemotePrompt>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .field("prompts", &self.prompts.len())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Connect and load both catalogs. A server that fails to list its
    /// catalogs still connects with an empty one, unless the connection
    /// itself broke.
    pub async fn establish(connector: &dyn Connector, name: &str, spec: &ServerSpec) -> Result<Self> {
        let client = connector.connect(name, spec).await?;
        let mut connection = Self {
            name: name.to_string(),
            spec: spec.clone(),
            client,
            tools: Vec::new(),
            prompts: Vec::new(),
        };
        if let Err(e) = connection.load_catalogs().await {
            let _ = connection.client.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Re-read both catalogs from the server. When the tool listing fails
    /// for any reason the current catalogs stay in place.
    pub async fn refresh(&mut self) -> Result<()> {
        let tools = self.client.list_tools().await?;
        let prompts = self.fetch_prompts().await?;
        self.tools = to_specs(&self.name, tools);
        self.prompts = prompts;
        Ok(())
    }

    /// Like [`refresh`](Self::refresh), but a server that cannot list its
    /// tools gets an empty catalog unless the connection itself broke.
    pub async fn load_catalogs(&mut self) -> Result<()> {
        match self.refresh().await {
            Err(e) if !e.is_connection_failure() => {
                warn!(server = %self.name, error = %e, "Listing tools failed; treating as empty");
                self.tools = Vec::new();
                self.prompts = self.fetch_prompts().await?;
                Ok(())
            }
            other => other,
        }
    }

    async fn fetch_prompts(&self) -> Result<Vec<RemotePrompt>> {
        match self.client.list_prompts().await {
            Ok(prompts) => Ok(prompts),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => {
                debug!(server = %self.name, error = %e, "Prompts unavailable");
                Ok(Vec::new())
            }
        }
    }

    pub fn find_tool(&self, raw: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.raw_name() == raw)
    }
}

fn to_specs(server: &str, tools: Vec<RemoteTool>) -> Vec<ToolSpec> {
    tools
        .into_iter()
        .filter(|tool| {
            let valid = is_valid_tool_name(server, &tool.name);
            if !valid {
                warn!(server, tool = %tool.name, "Skipping tool with unusable name");
            }
            valid
        })
        .map(|tool| {
            ToolSpec::new(
                server,
                &tool.name,
                tool.description.unwrap_or_default(),
                tool.input_schema,
            )
        })
        .collect()
}
