//! Tool Dispatcher
//!
//! Resolves a namespaced tool name to a live server and runs the call
//! through the approval gate, pre-hooks, a timed call with operator
//! force-stop, and post-hooks. Every failure after resolution becomes an
//! ordinary error result the model can read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_core::control::{ApprovalDecision, Controls};
use agent_core::observer::{ChatLog, Discard, ToolExecutionRecord};
use agent_core::tool::{DEFAULT_MAX_DISPLAY_CHARS, ToolExecutionResult, ToolExecutor, ToolSpec, split_namespaced};
use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ServerConnection;
use crate::error::{McpError, Result};
use crate::hooks::{HookContext, HookSet, HookToolInvoker, PreHookOutcome};
use crate::protocol::CallToolResult;
use crate::registry::ServerRegistry;

const ARGS_PREVIEW_CHARS: usize = 200;

pub const FORCE_STOPPED_TEXT: &str = "Tool execution force-stopped by user";

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub tool_timeout: Duration,
    pub max_display_chars: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(120),
            max_display_chars: DEFAULT_MAX_DISPLAY_CHARS,
        }
    }
}

enum CallOutcome {
    Finished(Result<CallToolResult>),
    TimedOut,
    ForceStopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Ok,
    Error,
    Timeout,
    Rejected,
    ForceStopped,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::ForceStopped => "force_stopped",
        }
    }
}

pub struct ToolDispatcher {
    registry: Arc<ServerRegistry>,
    controls: Controls,
    hooks: HookSet,
    chat_log: Arc<dyn ChatLog>,
    config: DispatcherConfig,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ServerRegistry>, controls: Controls) -> Self {
        Self {
            registry,
            controls,
            hooks: HookSet::new(),
            chat_log: Arc::new(Discard),
            config: DispatcherConfig::default(),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    /// Receives records of tools invoked by hooks
    #[must_use]
    pub fn with_chat_log(mut self, chat_log: Arc<dyn ChatLog>) -> Self {
        self.chat_log = chat_log;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Find the server for `name` and the raw tool name to send it. Falls
    /// back to the first server whose catalog has a matching raw name.
    pub async fn resolve(&self, name: &str) -> Result<(ServerConnection, String)> {
        if let Some((server, raw)) = split_namespaced(name) {
            if let Some(connection) = self.registry.connection(server).await {
                return Ok((connection, raw.to_string()));
            }
        }

        let mut candidates = vec![name];
        if let Some((_, raw)) = split_namespaced(name) {
            candidates.push(raw);
        }
        for raw in candidates {
            if let Some(connection) = self.registry.find_by_raw_name(raw).await {
                return Ok((connection, raw.to_string()));
            }
        }
        Err(McpError::ToolNotFound(name.to_string()))
    }

    /// Execute one tool call. Only a failure to resolve the tool is an `Err`.
    pub async fn execute(&self, name: &str, input: Value) -> Result<ToolExecutionResult> {
        self.run(name, input, true).await
    }

    async fn run(&self, name: &str, input: Value, with_hooks: bool) -> Result<ToolExecutionResult> {
        let (connection, raw) = self.resolve(name).await?;
        let started = Instant::now();

        if let ApprovalDecision::Reject(reason) = self.controls.approver.approve(name, &input).await {
            audit(name, &connection.name, Outcome::Rejected, started, &input);
            return Ok(ToolExecutionResult::error(reason));
        }

        let hooks = if with_hooks { self.hooks.clone() } else { HookSet::new() };
        let ctx = HookContext {
            tool: name,
            input: &input,
            invoker: self,
        };
        let injected = match hooks.run_before(&ctx).await {
            PreHookOutcome::Block(reason) => {
                audit(name, &connection.name, Outcome::Rejected, started, &input);
                return Ok(ToolExecutionResult::error(format!("Blocked by hook: {reason}")));
            }
            PreHookOutcome::Continue { inject } => inject,
        };

        let (mut result, outcome) = match self.timed_call(name, &connection, &raw, input.clone(), started).await {
            CallOutcome::Finished(Ok(call)) => {
                let outcome = if call.is_error { Outcome::Error } else { Outcome::Ok };
                let result = ToolExecutionResult::from_content(
                    call.into_blocks(),
                    outcome == Outcome::Error,
                    self.config.max_display_chars,
                );
                (result, outcome)
            }
            CallOutcome::Finished(Err(e)) => (ToolExecutionResult::error(e.to_string()), Outcome::Error),
            CallOutcome::TimedOut => (
                ToolExecutionResult::error(format!(
                    "Tool '{name}' timed out after {}s",
                    self.config.tool_timeout.as_secs_f32()
                )),
                Outcome::Timeout,
            ),
            CallOutcome::ForceStopped => (ToolExecutionResult::cancelled(Some(FORCE_STOPPED_TEXT)), Outcome::ForceStopped),
        };

        if let Some(note) = injected {
            result.append_note(&note);
        }
        for note in hooks.run_after(&ctx, &result).await {
            result.append_note(&note);
        }

        audit(name, &connection.name, outcome, started, &input);
        Ok(result)
    }

    /// Issue the call under the tool timeout. If cancellation is requested
    /// while it runs, ask the force-stopper once; a confirmed stop kills and
    /// reconnects the server.
    async fn timed_call(
        &self,
        name: &str,
        connection: &ServerConnection,
        raw: &str,
        input: Value,
        started: Instant,
    ) -> CallOutcome {
        let call = connection.client.call_tool(raw, input);
        tokio::pin!(call);
        let deadline = tokio::time::sleep(self.config.tool_timeout);
        tokio::pin!(deadline);

        let finished = CancellationToken::new();
        let mut decision: Option<JoinHandle<bool>> = None;
        let mut asked = false;

        let outcome = loop {
            tokio::select! {
                result = &mut call => break CallOutcome::Finished(result),
                () = &mut deadline => break CallOutcome::TimedOut,
                () = self.controls.canceller.cancelled(), if !asked => {
                    asked = true;
                    let stopper = Arc::clone(&self.controls.force_stopper);
                    let tool = name.to_string();
                    let elapsed = started.elapsed();
                    let token = finished.clone();
                    decision = Some(tokio::spawn(async move {
                        stopper.confirm_force_stop(&tool, elapsed, token).await
                    }));
                }
                confirmed = async {
                    match decision.as_mut() {
                        Some(handle) => handle.await.unwrap_or(false),
                        None => std::future::pending().await,
                    }
                }, if decision.is_some() => {
                    decision = None;
                    if confirmed {
                        break CallOutcome::ForceStopped;
                    }
                }
            }
        };

        finished.cancel();
        if let Some(handle) = decision {
            handle.abort();
        }

        if matches!(outcome, CallOutcome::ForceStopped) {
            warn!(tool = name, server = %connection.name, "Force-stopping tool-server");
            if let Err(e) = self.registry.reconnect(&connection.name).await {
                warn!(server = %connection.name, error = %e, "Reconnect after force-stop failed");
            }
        }
        outcome
    }
}

fn audit(tool: &str, server: &str, outcome: Outcome, started: Instant, input: &Value) {
    let mut args_preview = input.to_string();
    if let Some((cut, _)) = args_preview.char_indices().nth(ARGS_PREVIEW_CHARS) {
        args_preview.truncate(cut);
        args_preview.push_str("...");
    }
    info!(
        target: "tool_audit",
        tool,
        server,
        outcome = outcome.as_str(),
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        args_preview = %args_preview,
        "Tool call"
    );
}

#[async_trait]
impl ToolExecutor for ToolDispatcher {
    async fn available_tools(&self) -> Vec<ToolSpec> {
        self.registry.agent_tools().await
    }

    async fn execute(&self, name: &str, input: Value) -> ToolExecutionResult {
        Self::execute(self, name, input)
            .await
            .unwrap_or_else(|e| ToolExecutionResult::error(e.to_string()))
    }
}

#[async_trait]
impl HookToolInvoker for ToolDispatcher {
    /// Hook-invoked tools skip hooks themselves and are logged as such.
    async fn invoke_from_hook(&self, tool: &str, input: Value) -> ToolExecutionResult {
        let result = self
            .run(tool, input.clone(), false)
            .await
            .unwrap_or_else(|e| ToolExecutionResult::error(e.to_string()));
        let record = ToolExecutionRecord::new(uuid::Uuid::new_v4().to_string(), tool, input, result.clone()).from_hook();
        self.chat_log.tool_execution_added(&record);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use agent_core::control::{AlwaysForceStop, Approver, CancelFlag};
    use agent_core::event::TokenUsage;
    use agent_core::message::Message;
    use serde_json::json;

    use super::*;
    use crate::hooks::ToolHook;
    use crate::testing::{FakeConnector, FakeServer};

    async fn setup(connector: &FakeConnector, controls: Controls) -> ToolDispatcher {
        let registry = Arc::new(ServerRegistry::new(Arc::new(connector.clone())));
        registry.connect_all(&connector.config()).await.unwrap();
        ToolDispatcher::new(registry, controls)
    }

    fn servers() -> FakeConnector {
        FakeConnector::new()
            .with_server(FakeServer::new("alpha").tool("search"))
            .with_server(FakeServer::new("beta").tool("search").tool("fetch"))
    }

    fn controls() -> Controls {
        Controls::new(Arc::new(CancelFlag::new()))
    }

    #[derive(Default)]
    struct Records(Mutex<Vec<ToolExecutionRecord>>);

    impl ChatLog for Records {
        fn user_message_added(&self, _: &Message) {}
        fn assistant_message_added(&self, _: &Message) {}
        fn tool_execution_added(&self, record: &ToolExecutionRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
        fn token_usage(&self, _: &TokenUsage) {}
    }

    #[tokio::test]
    async fn test_namespaced_call_reaches_only_its_server() {
        let connector = servers();
        let dispatcher = setup(&connector, controls()).await;

        let result = dispatcher.execute("alpha__search", json!({"q": "x"})).await.unwrap();

        assert_eq!(result.display_text, "alpha:search ok");
        assert_eq!(connector.calls_to("alpha"), 1);
        assert_eq!(connector.calls_to("beta"), 0);
    }

    #[tokio::test]
    async fn test_legacy_raw_name_falls_back_to_first_match() {
        let connector = servers();
        let dispatcher = setup(&connector, controls()).await;

        let (connection, raw) = dispatcher.resolve("fetch").await.unwrap();
        assert_eq!((connection.name.as_str(), raw.as_str()), ("beta", "fetch"));
        let (connection, _) = dispatcher.resolve("search").await.unwrap();
        assert_eq!(connection.name, "alpha");
        let (connection, raw) = dispatcher.resolve("gone__fetch").await.unwrap();
        assert_eq!((connection.name.as_str(), raw.as_str()), ("beta", "fetch"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let connector = servers();
        let dispatcher = setup(&connector, controls()).await;

        assert!(matches!(
            dispatcher.execute("nope", json!({})).await,
            Err(McpError::ToolNotFound(_))
        ));
        let result = ToolExecutor::execute(&dispatcher, "nope", json!({})).await;
        assert!(result.is_error);
        assert!(result.display_text.contains("Tool not found in any server"));
    }

    #[tokio::test]
    async fn test_disabled_server_is_still_invokable() {
        let connector = servers();
        let dispatcher = setup(&connector, controls()).await;
        dispatcher.registry().set_server_enabled("beta", false).await.unwrap();

        assert_eq!(dispatcher.available_tools().await.len(), 1);
        let result = dispatcher.execute("beta__fetch", json!({})).await.unwrap();
        assert!(!result.is_error);
    }

    struct Deny;

    #[async_trait]
    impl Approver for Deny {
        async fn approve(&self, _tool: &str, _input: &Value) -> ApprovalDecision {
            ApprovalDecision::Reject("operator declined".into())
        }
    }

    #[tokio::test]
    async fn test_rejected_call_never_runs() {
        let connector = servers();
        let dispatcher = setup(&connector, controls().with_approver(Arc::new(Deny))).await;

        let result = dispatcher.execute("alpha__search", json!({})).await.unwrap();

        assert!(result.is_error);
        assert!(result.display_text.contains("operator declined"));
        assert_eq!(connector.calls_to("alpha"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error_result() {
        let connector = FakeConnector::new().with_server(FakeServer::new("slow").tool("wait").slow(Duration::from_secs(30)));
        let dispatcher = setup(&connector, controls()).await.with_config(DispatcherConfig {
            tool_timeout: Duration::from_secs(1),
            ..DispatcherConfig::default()
        });

        let result = dispatcher.execute("slow__wait", json!({})).await.unwrap();

        assert!(result.is_error);
        assert!(result.display_text.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_reconnects_server() {
        let connector = FakeConnector::new().with_server(FakeServer::new("slow").tool("wait").slow(Duration::from_secs(30)));
        let cancel = CancelFlag::new();
        let controls = Controls::new(Arc::new(cancel.clone())).with_force_stopper(Arc::new(AlwaysForceStop));
        let dispatcher = setup(&connector, controls).await;

        cancel.cancel();
        let result = dispatcher.execute("slow__wait", json!({})).await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.display_text, FORCE_STOPPED_TEXT);
        assert_eq!(connector.connects("slow"), 2);
        assert!(dispatcher.registry().connection("slow").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_force_stop_waits_for_completion() {
        let connector = FakeConnector::new().with_server(FakeServer::new("slow").tool("wait").slow(Duration::from_secs(3)));
        let cancel = CancelFlag::new();
        let dispatcher = setup(&connector, Controls::new(Arc::new(cancel.clone()))).await;

        cancel.cancel();
        let result = dispatcher.execute("slow__wait", json!({})).await.unwrap();

        assert!(!result.cancelled);
        assert_eq!(result.display_text, "slow:wait ok");
        assert_eq!(connector.connects("slow"), 1);
    }

    struct BlockAll;

    #[async_trait]
    impl ToolHook for BlockAll {
        async fn before(&self, _ctx: &HookContext<'_>) -> PreHookOutcome {
            PreHookOutcome::Block("read-only session".into())
        }
    }

    struct FetchFirst;

    #[async_trait]
    impl ToolHook for FetchFirst {
        async fn before(&self, ctx: &HookContext<'_>) -> PreHookOutcome {
            let fetched = ctx.invoker.invoke_from_hook("beta__fetch", json!({})).await;
            PreHookOutcome::Continue {
                inject: Some(format!("context: {}", fetched.display_text)),
            }
        }

        async fn after(&self, _ctx: &HookContext<'_>, _result: &ToolExecutionResult) -> Option<String> {
            Some("checked".into())
        }
    }

    #[tokio::test]
    async fn test_hooks_block_inject_and_invoke() {
        let connector = servers();
        let records = Arc::new(Records::default());
        let hooks = HookSet::new()
            .with_hook("beta__*", Arc::new(BlockAll))
            .with_hook("alpha__search", Arc::new(FetchFirst));
        let dispatcher = setup(&connector, controls())
            .await
            .with_hooks(hooks)
            .with_chat_log(records.clone());

        let blocked = dispatcher.execute("beta__search", json!({})).await.unwrap();
        assert!(blocked.is_error);
        assert!(blocked.display_text.contains("read-only session"));

        let result = dispatcher.execute("alpha__search", json!({})).await.unwrap();
        assert!(result.display_text.starts_with("alpha:search ok"));
        assert!(result.display_text.contains("context: beta:fetch ok"));
        assert!(result.display_text.ends_with("checked"));

        // The hook's own call bypasses the beta block.
        assert_eq!(connector.calls_to("beta"), 1);
        let records = records.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].from_hook);
        assert_eq!(records[0].name, "beta__fetch");
    }
}
