//! Stdio Transport
//!
//! Spawns a tool-server as a child process and speaks newline-delimited
//! JSON-RPC over its stdin/stdout. A reader task routes responses to the
//! waiting request by id; stderr is forwarded to debug logs.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::client::{Connector, ToolServerClient};
use crate::config::ServerSpec;
use crate::error::{McpError, METHOD_NOT_FOUND, Result};
use crate::protocol::{
    CallToolResult, GetPromptResult, Incoming, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, PROTOCOL_VERSION, PromptsListResult, RemotePrompt, RemoteTool,
    ToolsListResult,
};

/// Environment variable handed to servers so they can route tool calls back
/// through the agent's listener
pub const ROUTER_URL_ENV: &str = "AGENT_TOOL_ROUTER_URL";

/// Time a server gets to exit after stdin closes before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on catalog pages, against servers that never stop paginating
const MAX_PAGES: usize = 100;

/// Requests awaiting a response, by id
#[derive(Clone, Debug, Default)]
struct Pending {
    waiters: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
}

impl Pending {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id`; the entry lives until the slot is dropped or answered.
    fn register(&self, id: u64) -> (PendingSlot, oneshot::Receiver<JsonRpcResponse>) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (
            PendingSlot {
                id,
                pending: self.clone(),
            },
            rx,
        )
    }

    fn resolve(&self, id: u64, response: JsonRpcResponse) {
        if let Some(tx) = self.lock().remove(&id) {
            let _ = tx.send(response);
        }
    }

    /// Fail every outstanding request
    fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes its request from [`Pending`] when the caller stops waiting,
/// whether by answer, timeout or the request future being dropped.
struct PendingSlot {
    id: u64,
    pending: Pending,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// A live stdio connection
pub struct StdioClient {
    name: String,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl StdioClient {
    /// Spawn the server and complete the `initialize` handshake.
    pub async fn spawn(name: &str, spec: &ServerSpec, extra_env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(extra_env)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            server: name.to_string(),
            reason: format!("failed to spawn '{}': {e}", spec.command),
        })?;

        let missing = |pipe: &str| McpError::ConnectionFailed {
            server: name.to_string(),
            reason: format!("failed to capture {pipe}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let pending = Pending::default();

        tokio::spawn(read_loop(
            name.to_string(),
            BufReader::new(stdout),
            pending.clone(),
            Arc::clone(&stdin),
        ));

        let server = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, "{line}");
            }
        });

        let client = Self {
            name: name.to_string(),
            stdin,
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: spec.timeout(),
        };

        if let Err(e) = client.initialize().await {
            let _ = client.close().await;
            return Err(McpError::ConnectionFailed {
                server: name.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self.request("initialize", Some(params), Some(self.request_timeout)).await?;
        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(server = %self.name, protocol = version, "Tool-server initialized");

        self.notify("notifications/initialized", None).await
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport(format!("'{}' is closed", self.name)))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(line).await
    }

    /// Send a request and wait for its response; `timeout` of `None` waits
    /// until the server answers or the connection drops.
    async fn request(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (_slot, rx) = self.pending.register(id);

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        self.write_line(line).await?;

        let closed = || McpError::Transport(format!("'{}' closed while awaiting {method}", self.name));
        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| McpError::Timeout(method.to_string()))?
                .map_err(|_| closed())?,
            None => rx.await.map_err(|_| closed())?,
        };

        if let Some(JsonRpcError { code, message, .. }) = response.error {
            return Err(McpError::Protocol { code, message });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn request_as<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let value = self.request(method, params, Some(self.request_timeout)).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ToolServerClient for StdioClient {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ToolsListResult = self.request_as("tools/list", params).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let params = json!({ "name": name, "arguments": arguments });
        let value = self.request("tools/call", Some(params), None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_prompts(&self) -> Result<Vec<RemotePrompt>> {
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: PromptsListResult = self.request_as("prompts/list", params).await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(prompts)
    }

    async fn get_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult> {
        self.request_as("prompts/get", Some(json!({ "name": name, "arguments": arguments })))
            .await
    }

    async fn close(&self) -> Result<()> {
        // Closing stdin asks the server to exit.
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
            warn!(server = %self.name, "Tool-server did not exit in time, killing");
            if let Err(e) = child.kill().await {
                debug!(server = %self.name, error = %e, "Kill failed");
            }
        }

        // Wake anyone still waiting.
        self.pending.clear();
        info!(server = %self.name, "Tool-server closed");
        Ok(())
    }
}

async fn read_loop(
    server: String,
    stdout: BufReader<tokio::process::ChildStdout>,
    pending: Pending,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
) {
    let mut lines = stdout.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, error = %e, "Tool-server stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Incoming::parse(&line) {
            Some(Incoming::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    debug!(server = %server, "Response with non-numeric id ignored");
                    continue;
                };
                pending.resolve(id, response);
            }
            Some(Incoming::Request { id, method }) => {
                let reply = if method == "ping" {
                    json!({ "jsonrpc": "2.0", "id": id, "result": {} })
                } else {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": METHOD_NOT_FOUND, "message": format!("Method not found: {method}") }
                    })
                };
                let mut guard = stdin.lock().await;
                if let Some(stdin) = guard.as_mut() {
                    let line = format!("{reply}\n");
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        debug!(server = %server, error = %e, "Reply to server request failed");
                    }
                    let _ = stdin.flush().await;
                }
            }
            Some(Incoming::Notification { method, .. }) => {
                debug!(server = %server, method = %method, "Server notification");
            }
            None => debug!(server = %server, "Non-protocol output: {line}"),
        }
    }

    // Dropping the senders fails every outstanding request.
    pending.clear();
    debug!(server = %server, "Tool-server stdout closed");
}

/// Production connector: spawns servers over stdio
#[derive(Clone, Debug, Default)]
pub struct StdioConnector {
    extra_env: HashMap<String, String>,
}

impl StdioConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell every spawned server where the agent's listener is.
    #[must_use]
    pub fn with_router_url(mut self, url: impl Into<String>) -> Self {
        self.extra_env.insert(ROUTER_URL_ENV.to_string(), url.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, name: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServerClient>> {
        let client = StdioClient::spawn(name, spec, &self.extra_env).await?;
        Ok(Arc::new(client))
    }
}
