//! Tool-hub agent
//!
//! Connects the configured tool-servers, starts the local listener that
//! sub-agents route tool calls through, and drives the conversation from
//! standard input. Ctrl-C cancels the query in flight; when idle it exits.

mod config;
mod console;
mod listener;
mod state;

use std::sync::Arc;

use agent_core::{
    BusyFlag, CancelFlag, ContentBlock, Controls, MemoryTaskStore, Orchestrator, TaskEnforcementController, TaskTools,
    TurnStop,
    control::AlwaysForceStop,
    tasks::{ExistingTasks, FinishedTasks, FixedDecider},
};
use agent_mcp::{
    DispatcherConfig, FileToolStateStore, McpConfig, McpError, ServerRegistry, StdioConnector,
    ToolDispatcher,
};
use agent_runtime::{ProviderConfig, build_adapter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::console::{ConsoleObserver, TracingChatLog};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env()?;

    // Tool-servers learn the listener address through their environment
    let connector = StdioConnector::new().with_router_url(config.router_url());
    let store = Arc::new(FileToolStateStore::new(config.tool_state.clone()));
    let registry = Arc::new(ServerRegistry::with_state_store(Arc::new(connector), store)?);

    let mcp_config = if config.mcp_config.exists() {
        McpConfig::from_file(&config.mcp_config)?
    } else {
        tracing::warn!(path = %config.mcp_config.display(), "No tool-server config; running without tools");
        McpConfig::new()
    };
    let report = registry.connect_all(&mcp_config).await?;
    tracing::info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        tools = registry.agent_tools().await.len(),
        "Tool-servers ready"
    );

    let cancel = CancelFlag::new();
    let busy = BusyFlag::new();
    let observer = Arc::new(ConsoleObserver);
    let chat_log = Arc::new(TracingChatLog);

    let mut controls = Controls::new(Arc::new(cancel.clone()));
    if config.force_stop {
        controls = controls.with_force_stopper(Arc::new(AlwaysForceStop));
    }
    let dispatcher = Arc::new(
        ToolDispatcher::new(Arc::clone(&registry), controls)
            .with_chat_log(chat_log.clone())
            .with_config(DispatcherConfig {
                tool_timeout: config.tool_timeout,
                ..DispatcherConfig::default()
            }),
    );

    // The model tracks its own tasks; enforcement reads the same list
    let task_store = Arc::new(MemoryTaskStore::new());
    let executor = Arc::new(TaskTools::new(Arc::clone(&task_store), dispatcher.clone()));

    let adapter = build_adapter(ProviderConfig::from_env(config.provider)?)?;
    let mut builder = Orchestrator::builder()
        .adapter(adapter)
        .executor(executor)
        .cancel_flag(cancel.clone())
        .busy_flag(busy.clone())
        .chat_log(chat_log.clone())
        .observer(observer.clone())
        .model(&config.model)
        .max_output_tokens(config.max_output_tokens)
        .iterations(config.iterations)
        .context_settings(config.context.clone());
    if let Some(prompt) = &config.system_prompt {
        builder = builder.system_prompt(prompt);
    }
    let mut orchestrator = builder.build()?;

    let shutdown = CancellationToken::new();
    let tcp = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let listener_task = tokio::spawn(listener::serve(
        tcp,
        AppState {
            dispatcher,
            busy: busy.clone(),
            observer,
            chat_log,
        },
        shutdown.clone(),
    ));

    spawn_interrupt_handler(cancel, busy, shutdown.clone());

    let mut tasks = TaskEnforcementController::new(
        task_store,
        Arc::new(FixedDecider {
            existing: ExistingTasks::Leave,
            finished: FinishedTasks::Leave,
        }),
    );

    tracing::info!(
        provider = %config.provider,
        model = %config.model,
        listener = %config.router_url(),
        "Agent ready; type a message, /help for commands"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (query, attachments) = if let Some(rest) = line.strip_prefix("/prompt ") {
            match expand_prompt(&registry, rest).await {
                Ok(expanded) => expanded,
                Err(e) => {
                    println!("error: {e}");
                    continue;
                }
            }
        } else if let Some(command) = line.strip_prefix('/') {
            if !run_command(command, &registry, &mut orchestrator, &mut tasks).await {
                break;
            }
            continue;
        } else {
            (line.to_string(), Vec::new())
        };

        match tasks.run_user_turn(&mut orchestrator, &query, attachments).await {
            Ok(outcome) => {
                if outcome.stop == TurnStop::Cancelled {
                    println!("\n(cancelled)");
                }
                if let Some(compaction) = outcome.compaction {
                    tracing::info!(?compaction, "Conversation compacted");
                }
            }
            Err(e) => {
                tracing::error!("Agent error: {}", e);
                println!("\nerror: {}", e.user_message());
            }
        }
    }

    shutdown.cancel();
    registry.disconnect_all().await;
    if let Err(e) = listener_task.await? {
        tracing::warn!(error = %e, "Tool listener stopped with an error");
    }
    Ok(())
}

/// First Ctrl-C cancels the running query; Ctrl-C while idle shuts down.
fn spawn_interrupt_handler(cancel: CancelFlag, busy: BusyFlag, shutdown: CancellationToken) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if busy.is_busy() {
                tracing::info!("Cancelling current query");
                cancel.cancel();
            } else {
                shutdown.cancel();
                break;
            }
        }
    });
}

/// Expand `<server> <prompt>` into the text and attachments of a user turn.
async fn expand_prompt(registry: &ServerRegistry, spec: &str) -> agent_mcp::Result<(String, Vec<ContentBlock>)> {
    let mut parts = spec.split_whitespace();
    let (Some(server), Some(name)) = (parts.next(), parts.next()) else {
        return Err(McpError::Config("usage: /prompt <server> <prompt>".into()));
    };
    let prompt = registry.agent_prompt(server, name, serde_json::json!({})).await?;

    let mut texts = Vec::new();
    let mut attachments = Vec::new();
    for block in prompt.messages.into_iter().filter_map(|m| m.content.into_block()) {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            other => attachments.push(other),
        }
    }
    Ok((texts.join("\n\n"), attachments))
}

/// Handle a slash command; false means quit.
async fn run_command(
    command: &str,
    registry: &ServerRegistry,
    orchestrator: &mut Orchestrator,
    tasks: &mut TaskEnforcementController,
) -> bool {
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    if matches!(name, "quit" | "exit") {
        return false;
    }
    if let Err(e) = execute_command(name, parts.next(), registry, orchestrator, tasks).await {
        println!("error: {}", e.user_message());
    }
    true
}

async fn execute_command(
    name: &str,
    arg: Option<&str>,
    registry: &ServerRegistry,
    orchestrator: &mut Orchestrator,
    tasks: &mut TaskEnforcementController,
) -> agent_core::Result<()> {
    match (name, arg) {
        ("tools", _) => {
            for tool in registry.agent_tools().await {
                println!("  {}  {}", tool.name, tool.description);
            }
        }
        ("prompts", _) => {
            for (server, prompt) in registry.agent_prompts().await {
                println!("  {server} {}  {}", prompt.name, prompt.description.unwrap_or_default());
            }
        }
        ("servers", _) => {
            for server in registry.server_names().await {
                println!("  {server}");
            }
        }
        ("refresh", _) => {
            let report = registry.refresh_catalogs().await?;
            println!("refreshed {} server(s), {} failed", report.connected.len(), report.failed.len());
        }
        ("reconnect", Some(server)) => {
            let catalog = registry.reconnect(server).await?;
            println!("{server}: {} tool(s)", catalog.tools.len());
        }
        ("enable" | "disable", Some(tool)) => {
            registry.set_tool_enabled(tool, name == "enable").await?;
        }
        ("enable-server" | "disable-server", Some(server)) => {
            registry.set_server_enabled(server, name == "enable-server").await?;
        }
        ("tasks", Some("on")) => tasks.enable().await?,
        ("tasks", Some("off")) => tasks.disable(),
        ("clear", _) => orchestrator.clear(),
        _ => println!(
            "commands: /tools /prompts /prompt <server> <prompt> /servers /refresh /reconnect <server> /enable <tool> /disable <tool> \
             /enable-server <server> /disable-server <server> /tasks on|off /clear /quit"
        ),
    }
    Ok(())
}
