//! In-memory tool-servers for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{Connector, ToolServerClient};
use crate::config::{McpConfig, ServerSpec};
use crate::error::{McpError, METHOD_NOT_FOUND, Result};
use crate::protocol::{CallToolResult, GetPromptResult, PromptMessage, RemoteContent, RemotePrompt, RemoteTool};

#[derive(Clone, Debug)]
pub struct FakeServer {
    pub name: String,
    pub tools: Vec<String>,
    pub prompts: Option<Vec<String>>,
    pub call_delay: Option<Duration>,
    pub catalog_fault: Option<CatalogFault>,
}

/// How a server's `tools/list` misbehaves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogFault {
    /// The pipe to the server broke
    Broken,
    /// The request timed out
    Stalled,
}

impl FakeServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            prompts: Some(Vec::new()),
            call_delay: None,
            catalog_fault: None,
        }
    }

    pub fn tool(mut self, raw: &str) -> Self {
        self.tools.push(raw.to_string());
        self
    }

    pub fn prompt(mut self, name: &str) -> Self {
        self.prompts.get_or_insert_with(Vec::new).push(name.to_string());
        self
    }

    /// Answers prompt requests with "method not found"
    pub fn without_prompts(mut self) -> Self {
        self.prompts = None;
        self
    }

    /// Every tool call takes this long
    pub const fn slow(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Shared {
    servers: HashMap<String, FakeServer>,
    unreachable: HashSet<String>,
    log: Vec<String>,
    connects: HashMap<String, usize>,
}

/// Connector whose servers live in memory. The log records
/// `call:{server}:{tool}` and `close:{server}` entries.
#[derive(Clone, Default)]
pub struct FakeConnector {
    shared: Arc<Mutex<Shared>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, server: FakeServer) -> Self {
        self.shared.lock().unwrap().servers.insert(server.name.clone(), server);
        self
    }

    /// Configured but fails to connect
    pub fn with_unreachable(self, name: &str) -> Self {
        self.shared.lock().unwrap().unreachable.insert(name.to_string());
        self
    }

    pub fn set_tools(&self, server: &str, tools: &[&str]) {
        if let Some(s) = self.shared.lock().unwrap().servers.get_mut(server) {
            s.tools = tools.iter().map(ToString::to_string).collect();
        }
    }

    pub fn break_catalog(&self, server: &str) {
        self.set_catalog_fault(server, CatalogFault::Broken);
    }

    pub fn stall_catalog(&self, server: &str) {
        self.set_catalog_fault(server, CatalogFault::Stalled);
    }

    fn set_catalog_fault(&self, server: &str, fault: CatalogFault) {
        if let Some(s) = self.shared.lock().unwrap().servers.get_mut(server) {
            s.catalog_fault = Some(fault);
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.shared.lock().unwrap().log.clone()
    }

    pub fn calls_to(&self, server: &str) -> usize {
        let prefix = format!("call:{server}:");
        self.log().iter().filter(|e| e.starts_with(&prefix)).count()
    }

    pub fn connects(&self, server: &str) -> usize {
        self.shared.lock().unwrap().connects.get(server).copied().unwrap_or(0)
    }

    /// Config naming every fake and unreachable server
    pub fn config(&self) -> McpConfig {
        let shared = self.shared.lock().unwrap();
        shared
            .servers
            .keys()
            .chain(shared.unreachable.iter())
            .fold(McpConfig::new(), |config, name| {
                config.with_server(name.clone(), ServerSpec::new(format!("{name}-server"), Vec::new()))
            })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, name: &str, _spec: &ServerSpec) -> Result<Arc<dyn ToolServerClient>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.unreachable.contains(name) || !shared.servers.contains_key(name) {
            return Err(McpError::ConnectionFailed {
                server: name.to_string(),
                reason: "unreachable".into(),
            });
        }
        *shared.connects.entry(name.to_string()).or_default() += 1;
        Ok(Arc::new(FakeClient {
            server: name.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeClient {
    server: String,
    shared: Arc<Mutex<Shared>>,
}

impl FakeClient {
    fn snapshot(&self) -> Result<FakeServer> {
        self.shared
            .lock()
            .unwrap()
            .servers
            .get(&self.server)
            .cloned()
            .ok_or_else(|| McpError::Transport("gone".into()))
    }
}

fn method_not_found() -> McpError {
    McpError::Protocol {
        code: METHOD_NOT_FOUND,
        message: "Method not found".into(),
    }
}

#[async_trait]
impl ToolServerClient for FakeClient {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let server = self.snapshot()?;
        match server.catalog_fault {
            Some(CatalogFault::Broken) => return Err(McpError::Transport("pipe closed".into())),
            Some(CatalogFault::Stalled) => return Err(McpError::Timeout("tools/list".into())),
            None => {}
        }
        Ok(server
            .tools
            .iter()
            .map(|name| RemoteTool {
                name: name.clone(),
                description: Some(format!("{name} tool")),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<CallToolResult> {
        let server = self.snapshot()?;
        self.shared
            .lock()
            .unwrap()
            .log
            .push(format!("call:{}:{name}", self.server));
        if let Some(delay) = server.call_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CallToolResult::text(format!("{}:{name} ok", self.server)))
    }

    async fn list_prompts(&self) -> Result<Vec<RemotePrompt>> {
        let server = self.snapshot()?;
        let prompts = server.prompts.ok_or_else(method_not_found)?;
        Ok(prompts
            .into_iter()
            .map(|name| RemotePrompt {
                name,
                description: None,
                arguments: Vec::new(),
            })
            .collect())
    }

    async fn get_prompt(&self, name: &str, _arguments: Value) -> Result<GetPromptResult> {
        let server = self.snapshot()?;
        let prompts = server.prompts.ok_or_else(method_not_found)?;
        if !prompts.iter().any(|p| p == name) {
            return Err(McpError::Protocol {
                code: -32602,
                message: format!("Unknown prompt: {name}"),
            });
        }
        Ok(GetPromptResult {
            description: None,
            messages: vec![PromptMessage {
                role: "user".into(),
                content: RemoteContent::Text {
                    text: format!("{name} body"),
                },
            }],
        })
    }

    async fn close(&self) -> Result<()> {
        self.shared
            .lock()
            .unwrap()
            .log
            .push(format!("close:{}", self.server));
        Ok(())
    }
}
