//! Conversation Orchestrator
//!
//! Drives a [`ProviderAdapter`]'s event stream and owns the canonical
//! message log. Text and reasoning deltas are accumulated and forwarded
//! live; the assistant turn is committed on `message_stop`; tool results are
//! paired the way the active backend requires. Cancellation is cooperative:
//! committed output is never discarded, only further round-trips are
//! suppressed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::admission::BusyFlag;
use crate::context::{Compaction, ContextManager, ContextSettings};
use crate::control::{CancelFlag, Canceller};
use crate::error::{AgentError, Result};
use crate::event::{BlockDelta, BlockStart, StreamEvent, TokenUsage};
use crate::message::{ContentBlock, Conversation, Message, ToolResultPairing};
use crate::observer::{ChatLog, Collaborators, Observer, ObserverEvent, ToolExecutionRecord};
use crate::provider::{Iterations, PendingToolCall, ProviderAdapter, StreamRequest};
use crate::tool::ToolExecutor;

/// Orchestrator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Model identifier passed to the adapter
    pub model: String,

    /// System prompt, sent through the backend's native system slot
    pub system_prompt: Option<String>,

    pub max_output_tokens: u32,

    /// Backend round-trips per turn
    pub iterations: Iterations,

    pub context: ContextSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            system_prompt: None,
            max_output_tokens: 8_192,
            iterations: Iterations::default(),
            context: ContextSettings::default(),
        }
    }
}

/// Why a turn ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStop {
    Completed,
    Cancelled,
    MaxIterations,
}

/// Summary of one processed turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    pub stop: TurnStop,
    pub assistant_messages: usize,
    pub tool_calls: usize,
    pub usage: Option<TokenUsage>,
    pub compaction: Option<Compaction>,
}

impl TurnOutcome {
    const fn new(stop: TurnStop) -> Self {
        Self {
            stop,
            assistant_messages: 0,
            tool_calls: 0,
            usage: None,
            compaction: None,
        }
    }

    pub fn completed(&self) -> bool {
        self.stop == TurnStop::Completed
    }
}

/// Block being assembled from deltas
#[derive(Debug)]
struct PendingBlock {
    id: String,
    kind: BlockStart,
    buffer: String,
    signature: Option<String>,
}

/// In-flight state of one backend round-trip
#[derive(Debug, Default)]
struct TurnState {
    model: Option<String>,
    rounds: usize,
    blocks: Vec<PendingBlock>,
    index: HashMap<String, usize>,
    tools: Vec<ToolExecutionRecord>,
    complete_response: Option<Vec<ContentBlock>>,
    usage_reported: bool,
    notices: Vec<String>,
}

impl TurnState {
    fn open(&mut self, id: String, kind: BlockStart) -> &mut PendingBlock {
        let position = *self.index.entry(id.clone()).or_insert_with(|| {
            self.blocks.push(PendingBlock {
                id,
                kind,
                buffer: String::new(),
                signature: None,
            });
            self.blocks.len() - 1
        });
        &mut self.blocks[position]
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.tools.is_empty() && self.complete_response.is_none()
    }

    /// Final blocks of the assistant turn. A complete response is
    /// authoritative over the delta-accumulated version.
    fn take_blocks(&mut self, records: &[ToolExecutionRecord]) -> Vec<ContentBlock> {
        let pending = std::mem::take(&mut self.blocks);
        self.index.clear();

        let mut blocks = self.complete_response.take().unwrap_or_else(|| {
            pending
                .into_iter()
                .filter_map(|block| match block.kind {
                    BlockStart::Text => {
                        (!block.buffer.is_empty()).then(|| ContentBlock::text(block.buffer))
                    }
                    BlockStart::Thinking => Some(ContentBlock::Thinking {
                        thinking: block.buffer,
                        signature: block.signature,
                    }),
                    BlockStart::ToolUse { name } => {
                        let call = PendingToolCall::from_fragments(block.id, name, &block.buffer);
                        Some(ContentBlock::ToolUse {
                            id: call.id,
                            name: call.name,
                            input: call.input,
                        })
                    }
                })
                .collect()
        });

        for record in records {
            let existing = blocks.iter_mut().find_map(|b| match b {
                ContentBlock::ToolUse { id, input, .. } if *id == record.id => Some(input),
                _ => None,
            });
            match existing {
                Some(input) => input.clone_from(&record.input),
                None => blocks.push(ContentBlock::ToolUse {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    input: record.input.clone(),
                }),
            }
        }
        blocks
    }
}

/// What the event loop should do next
enum Flow {
    Continue,
    Stop,
}

/// Canonical conversation loop over one provider adapter
pub struct Orchestrator {
    adapter: Arc<dyn ProviderAdapter>,
    executor: Arc<dyn ToolExecutor>,
    cancel: CancelFlag,
    busy: BusyFlag,
    collaborators: Collaborators,
    conversation: Conversation,
    context: ContextManager,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Start building an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// The canonical message log
    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub const fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub const fn context(&self) -> &ContextManager {
        &self.context
    }

    /// Running token estimate (exact after a resync)
    pub const fn token_estimate(&self) -> u64 {
        self.context.estimate_tokens()
    }

    /// Request cancellation of the query in flight
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle for cancelling from another task
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn busy_flag(&self) -> BusyFlag {
        self.busy.clone()
    }

    /// Switch adapter (and model) for subsequent turns
    pub fn set_adapter(&mut self, adapter: Arc<dyn ProviderAdapter>, model: impl Into<String>) {
        self.config.model = model.into();
        self.context
            .set_context_window(adapter.context_window(&self.config.model));
        self.adapter = adapter;
    }

    /// Drop the whole history
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.context.set_estimate(0);
    }

    /// Append a user message without running a turn
    pub fn append_user_message(&mut self, message: Message) {
        self.context.add_estimate(message.estimate_tokens());
        self.collaborators.chat_log.user_message_added(&message);
        self.conversation.push(message);
    }

    /// Process one user query with optional attachment blocks.
    ///
    /// Fails with [`AgentError::Busy`] if a query is already in flight.
    pub async fn process_query(
        &mut self,
        text: &str,
        attachments: Vec<ContentBlock>,
    ) -> Result<TurnOutcome> {
        self.process_message(Message::user(text).with_blocks(attachments))
            .await
    }

    /// Process an arbitrary user-role message (queries, reminders)
    pub async fn process_message(&mut self, message: Message) -> Result<TurnOutcome> {
        self.process_messages(vec![message]).await
    }

    /// Append several user-role messages and run one turn over them. Nothing
    /// is appended when the query is refused as busy.
    pub async fn process_messages(&mut self, messages: Vec<Message>) -> Result<TurnOutcome> {
        let _guard = self.busy.try_acquire()?;
        self.cancel.reset();
        for message in messages {
            self.append_user_message(message);
        }

        let mut outcome = self.run_turn().await?;
        self.after_turn(&mut outcome).await;
        Ok(outcome)
    }

    /// Drive one adapter stream to completion against the current log.
    pub async fn run_turn(&mut self) -> Result<TurnOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(TurnOutcome::new(TurnStop::Cancelled));
        }
        self.prepare_history();

        let request = self.build_request().await;
        let canceller: Arc<dyn Canceller> = Arc::new(self.cancel.clone());
        tracing::debug!(
            adapter = self.adapter.name(),
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Starting turn"
        );
        let mut events = self
            .adapter
            .stream_with_tools(request, Arc::clone(&self.executor), canceller)
            .await
            .inspect_err(|e| self.notify(ObserverEvent::Error { message: e.user_message() }))?;

        let mut turn = TurnState::default();
        let mut outcome = TurnOutcome::new(TurnStop::Completed);

        while let Some(item) = events.next().await {
            let flow = match item {
                Ok(event) => self.handle_event(event, &mut turn, &mut outcome),
                Err(err) => Err(err),
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) => {
                    self.commit(&mut turn, &mut outcome);
                    self.append_notices(&mut turn);
                    self.notify(ObserverEvent::Error { message: err.user_message() });
                    return Err(err);
                }
            }
        }
        drop(events);

        self.commit(&mut turn, &mut outcome);
        if outcome.stop == TurnStop::Completed && self.cancel.is_cancelled() {
            outcome.stop = TurnStop::Cancelled;
        }
        self.append_notices(&mut turn);
        self.notify(ObserverEvent::Done);
        Ok(outcome)
    }

    async fn build_request(&self) -> StreamRequest {
        StreamRequest {
            messages: self.conversation.messages().to_vec(),
            model: self.config.model.clone(),
            system: self.config.system_prompt.clone(),
            tools: self.executor.available_tools().await,
            max_output_tokens: self.config.max_output_tokens,
            max_iterations: self.config.iterations.bound(),
        }
    }

    /// Never hand a backend orphaned results or dangling invocations.
    fn prepare_history(&mut self) {
        self.conversation.prune_orphan_results();
        let inserted = self.conversation.resolve_dangling(self.adapter.pairing());
        if inserted > 0 {
            tracing::info!(inserted, "Inserted cancelled results for unresolved tool calls");
        }
    }

    fn handle_event(
        &mut self,
        event: StreamEvent,
        turn: &mut TurnState,
        outcome: &mut TurnOutcome,
    ) -> Result<Flow> {
        match event {
            StreamEvent::MessageStart { model } => {
                if turn.rounds > 0 && self.cancel.is_cancelled() {
                    return Ok(Flow::Stop);
                }
                turn.rounds += 1;
                turn.model = model;
            }
            StreamEvent::ContentBlockStart { id, block } => {
                if let BlockStart::ToolUse { name } = &block {
                    self.notify(ObserverEvent::ToolStart {
                        name: name.clone(),
                        external: false,
                    });
                }
                turn.open(id, block);
            }
            StreamEvent::ContentBlockDelta { id, delta } => match delta {
                BlockDelta::Text(text) => {
                    turn.open(id, BlockStart::Text).buffer.push_str(&text);
                    self.notify(ObserverEvent::TextDelta { text });
                }
                BlockDelta::Thinking(text) => {
                    turn.open(id, BlockStart::Thinking).buffer.push_str(&text);
                    self.notify(ObserverEvent::ReasoningDelta { text });
                }
                BlockDelta::ThinkingSignature(signature) => {
                    turn.open(id, BlockStart::Thinking).signature = Some(signature);
                }
                BlockDelta::ToolInputJson(json) => {
                    if let Some(&position) = turn.index.get(&id) {
                        turn.blocks[position].buffer.push_str(&json);
                    }
                }
            },
            StreamEvent::ToolUseComplete {
                id,
                name,
                input,
                result,
            } => {
                let record = ToolExecutionRecord::new(id, name, input, result);
                self.collaborators.chat_log.tool_execution_added(&record);
                self.notify(ObserverEvent::ToolComplete {
                    name: record.name.clone(),
                    display_text: record.result.display_text.clone(),
                    is_error: record.result.is_error,
                    external: false,
                });
                turn.tools.push(record);
                outcome.tool_calls += 1;

                if self.cancel.is_cancelled() {
                    tracing::info!("Cancelled after tool completion; keeping completed output");
                    self.commit(turn, outcome);
                    return Ok(Flow::Stop);
                }
            }
            StreamEvent::TokenUsage(usage) => {
                self.context.set_estimate(usage.total());
                self.collaborators.chat_log.token_usage(&usage);
                self.notify(ObserverEvent::TokenUsage { usage });
                turn.usage_reported = true;
                outcome.usage = Some(usage);
            }
            StreamEvent::MessageStop { .. } => self.commit(turn, outcome),
            StreamEvent::CompleteResponse { blocks } => {
                turn.complete_response = Some(blocks);
            }
            StreamEvent::ClientInfo { message } => {
                tracing::info!(adapter = self.adapter.name(), %message, "Adapter notice");
                self.notify(ObserverEvent::Warning {
                    message: message.clone(),
                });
                turn.notices.push(message);
            }
            StreamEvent::MaxIterationsReached { iterations } => {
                tracing::warn!(iterations, "Maximum tool-use iterations reached");
                outcome.stop = TurnStop::MaxIterations;
                let message = AgentError::MaxIterations(iterations).user_message();
                self.notify(ObserverEvent::Warning {
                    message: message.clone(),
                });
                turn.notices.push(message);
            }
            StreamEvent::Error { message } => return Err(AgentError::Provider(message)),
        }
        Ok(Flow::Continue)
    }

    /// Commit the accumulated assistant turn and pair its tool results.
    fn commit(&mut self, turn: &mut TurnState, outcome: &mut TurnOutcome) {
        if turn.is_empty() {
            return;
        }
        let records = std::mem::take(&mut turn.tools);
        let blocks = turn.take_blocks(&records);
        if blocks.is_empty() {
            return;
        }

        let mut message = Message::assistant_blocks(blocks);
        if let Some(model) = turn.model.clone() {
            message = message.with_model(model);
        }
        if !turn.usage_reported {
            self.context.add_estimate(message.estimate_tokens());
        }
        self.collaborators.chat_log.assistant_message_added(&message);
        self.conversation.push(message);
        outcome.assistant_messages += 1;

        let results: Vec<ContentBlock> = records.iter().map(|r| r.result.to_block(&r.id)).collect();
        if !turn.usage_reported && !results.is_empty() {
            self.context
                .add_estimate(Message::tool_results(results.clone()).estimate_tokens());
        }
        match self.adapter.pairing() {
            ToolResultPairing::ById => {
                self.conversation.attach_results_by_id(results);
            }
            ToolResultPairing::ByPosition => {
                for block in results {
                    self.conversation.attach_result_by_position(block);
                }
            }
        }
        turn.usage_reported = false;
    }

    /// Recovered conditions still leave a visible trace in the log.
    fn append_notices(&mut self, turn: &mut TurnState) {
        for notice in turn.notices.drain(..) {
            let message = Message::assistant(format!("Note: {notice}")).synthetic();
            self.collaborators.chat_log.assistant_message_added(&message);
            self.conversation.push(message);
        }
    }

    async fn after_turn(&mut self, outcome: &mut TurnOutcome) {
        let request = self.build_request().await;
        match self.adapter.count_tokens(&request).await {
            Ok(Some(exact)) => self.context.resync(exact),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Exact token count unavailable"),
        }

        if self.context.should_summarize(self.context.estimate_tokens()) {
            outcome.compaction = self.compact().await;
        }
    }

    /// Summarize old history; failure is logged and leaves a notice.
    async fn compact(&mut self) -> Option<Compaction> {
        let result = self
            .context
            .summarize(&mut self.conversation, self.adapter.as_ref(), &self.config.model)
            .await;
        match result {
            Ok(compaction) => compaction,
            Err(e) => {
                tracing::warn!(error = %e, "Summarization failed; continuing uncompacted");
                self.notify(ObserverEvent::Warning {
                    message: e.to_string(),
                });
                let notice = Message::assistant(
                    "Note: the conversation could not be summarized; continuing with the full history.",
                )
                .synthetic();
                self.collaborators.chat_log.assistant_message_added(&notice);
                self.conversation.push(notice);
                None
            }
        }
    }

    fn notify(&self, event: ObserverEvent) {
        self.collaborators.observer.notify(&event);
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    adapter: Option<Arc<dyn ProviderAdapter>>,
    executor: Option<Arc<dyn ToolExecutor>>,
    cancel: CancelFlag,
    busy: BusyFlag,
    collaborators: Collaborators,
    history: Vec<Message>,
    config: OrchestratorConfig,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            adapter: None,
            executor: None,
            cancel: CancelFlag::new(),
            busy: BusyFlag::new(),
            collaborators: Collaborators::default(),
            history: Vec::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share a cancel flag with other components (e.g. the dispatcher)
    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share admission control with other entry points
    pub fn busy_flag(mut self, busy: BusyFlag) -> Self {
        self.busy = busy;
        self
    }

    pub fn chat_log(mut self, chat_log: Arc<dyn ChatLog>) -> Self {
        self.collaborators.chat_log = chat_log;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.collaborators.observer = observer;
        self
    }

    /// Resume from an existing log
    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub const fn max_output_tokens(mut self, max: u32) -> Self {
        self.config.max_output_tokens = max;
        self
    }

    pub const fn iterations(mut self, iterations: Iterations) -> Self {
        self.config.iterations = iterations;
        self
    }

    pub fn context_settings(mut self, settings: ContextSettings) -> Self {
        self.config.context = settings;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let adapter = self
            .adapter
            .ok_or_else(|| AgentError::Config("Provider adapter is required".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| AgentError::Config("Tool executor is required".into()))?;

        let conversation = Conversation::from_messages(self.history);
        let mut context = ContextManager::new(
            self.config.context.clone(),
            adapter.context_window(&self.config.model),
        );
        context.recount(&conversation);

        Ok(Orchestrator {
            adapter,
            executor,
            cancel: self.cancel,
            busy: self.busy,
            collaborators: self.collaborators,
            conversation,
            context,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::testing::{RecordingChatLog, RecordingExecutor, ScriptedAdapter, ScriptedRound};

    fn orchestrator(adapter: ScriptedAdapter, executor: RecordingExecutor) -> Orchestrator {
        Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(executor))
            .model("test-model")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_zero_tool_turn_commits_one_message() {
        let adapter = ScriptedAdapter::new().with_rounds(vec![ScriptedRound::text(&["Hel", "lo ", "world"])]);
        let mut orch = orchestrator(adapter, RecordingExecutor::new());

        let outcome = orch.process_query("hi", Vec::new()).await.unwrap();

        assert_eq!(outcome.stop, TurnStop::Completed);
        assert_eq!(outcome.assistant_messages, 1);
        assert_eq!(orch.messages().len(), 2);
        let reply = &orch.messages()[1];
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.text(), "Hello world");
        assert_eq!(reply.metadata.model.as_deref(), Some("test-model"));
    }

    #[tokio::test]
    async fn test_tool_results_pair_by_id() {
        let adapter = ScriptedAdapter::new().with_rounds(vec![
            ScriptedRound::tool("t1", "alpha__search"),
            ScriptedRound::text(&["done"]),
        ]);
        let log = Arc::new(RecordingChatLog::default());
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(RecordingExecutor::new()))
            .chat_log(log.clone())
            .build()
            .unwrap();

        let outcome = orch.process_query("find it", Vec::new()).await.unwrap();

        assert_eq!(outcome.tool_calls, 1);
        let roles: Vec<Role> = orch.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(orch.messages()[1].tool_use_ids(), vec!["t1"]);
        assert_eq!(orch.messages()[2].tool_result_ids(), vec!["t1"]);
        assert_eq!(orch.messages()[2].text(), "alpha__search ok");

        let entries = log.entries();
        let tool_at = entries.iter().position(|e| e == "tool:alpha__search").unwrap();
        let assistant_at = entries.iter().position(|e| e.starts_with("assistant:")).unwrap();
        assert!(tool_at < assistant_at);
    }

    #[tokio::test]
    async fn test_complete_response_pairs_by_position() {
        let adapter = ScriptedAdapter::new()
            .with_pairing(ToolResultPairing::ByPosition)
            .with_rounds(vec![
                ScriptedRound {
                    text_deltas: vec!["checking".into()],
                    tool_calls: vec![
                        PendingToolCall { id: "a".into(), name: "alpha__search".into(), input: serde_json::json!({}) },
                        PendingToolCall { id: "b".into(), name: "alpha__search".into(), input: serde_json::json!({}) },
                    ],
                    ..ScriptedRound::default()
                }
                .atomic(),
                ScriptedRound::text(&["all done"]).atomic(),
            ]);
        let mut orch = orchestrator(adapter, RecordingExecutor::new());

        orch.process_query("go", Vec::new()).await.unwrap();

        let messages = orch.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1].text(), "checking");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("b"));
        assert_eq!(messages[4].text(), "all done");
    }

    #[tokio::test]
    async fn test_cancel_after_tool_keeps_result_and_stops() {
        let cancel = CancelFlag::new();
        let adapter = ScriptedAdapter::new().with_rounds(vec![
            ScriptedRound::tool("x1", "alpha__search"),
            ScriptedRound::text(&["should never arrive"]),
        ]);
        let executor = RecordingExecutor::new().cancel_on("alpha__search", cancel.clone());
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter.clone()))
            .executor(Arc::new(executor))
            .cancel_flag(cancel)
            .build()
            .unwrap();

        let outcome = orch.process_query("go", Vec::new()).await.unwrap();

        assert_eq!(outcome.stop, TurnStop::Cancelled);
        assert_eq!(adapter.round_trips(), 1);
        let last = orch.messages().last().unwrap();
        assert_eq!(last.tool_result_ids(), vec!["x1"]);
        assert!(!orch.messages().iter().any(|m| m.text().contains("never arrive")));
    }

    #[tokio::test]
    async fn test_orphans_and_dangling_calls_never_reach_backend() {
        let adapter = ScriptedAdapter::new().with_rounds(vec![ScriptedRound::text(&["ok"])]);
        let history = vec![
            Message::user("earlier"),
            Message::tool_results(vec![ContentBlock::tool_result("ghost", "orphan")]),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "died".into(),
                name: "alpha__search".into(),
                input: serde_json::json!({}),
            }]),
        ];
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter.clone()))
            .executor(Arc::new(RecordingExecutor::new()))
            .history(history)
            .build()
            .unwrap();

        orch.process_query("continue", Vec::new()).await.unwrap();

        let sent = &adapter.requests()[0].messages;
        let ids: Vec<&str> = sent.iter().flat_map(Message::tool_result_ids).collect();
        assert_eq!(ids, vec!["died"]);
        assert!(sent.iter().all(|m| !m.tool_result_ids().contains(&"ghost")));
    }

    #[tokio::test]
    async fn test_second_query_is_rejected_while_busy() {
        let adapter = ScriptedAdapter::new();
        let mut orch = orchestrator(adapter, RecordingExecutor::new());
        let _held = orch.busy_flag().try_acquire().unwrap();

        let err = orch.process_query("hi", Vec::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Busy));
        assert!(orch.messages().is_empty());
    }

    #[tokio::test]
    async fn test_usage_replaces_estimate_and_exact_count_resyncs() {
        let adapter = ScriptedAdapter::new()
            .with_rounds(vec![ScriptedRound::text(&["hi"]).with_usage(500, 20)]);
        let mut orch = orchestrator(adapter, RecordingExecutor::new());
        orch.process_query("hello", Vec::new()).await.unwrap();
        assert_eq!(orch.token_estimate(), 520);

        let adapter = ScriptedAdapter::new()
            .with_exact_count(777)
            .with_rounds(vec![ScriptedRound::text(&["hi"]).with_usage(500, 20)]);
        let mut orch = orchestrator(adapter, RecordingExecutor::new());
        orch.process_query("hello", Vec::new()).await.unwrap();
        assert_eq!(orch.token_estimate(), 777);
    }

    #[tokio::test]
    async fn test_compaction_runs_after_turn() {
        let adapter = ScriptedAdapter::new()
            .with_context_window(1_000)
            .with_summary("greetings exchanged")
            .with_rounds(vec![ScriptedRound::text(&["reply"]).with_usage(900, 10)]);
        let history: Vec<Message> = (0..6)
            .map(|i| if i % 2 == 0 { Message::user("q") } else { Message::assistant("a") })
            .collect();
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(RecordingExecutor::new()))
            .history(history)
            .context_settings(ContextSettings { enabled: true, threshold_percent: 80, keep_recent: 2 })
            .build()
            .unwrap();

        let outcome = orch.process_query("hello", Vec::new()).await.unwrap();

        assert!(outcome.compaction.is_some());
        assert_eq!(orch.messages().len(), 3);
        assert!(orch.messages()[0].text().starts_with("[Previous conversation summary:"));
        assert!(orch.token_estimate() < 910);
    }

    #[tokio::test]
    async fn test_failed_summary_leaves_notice() {
        let adapter = ScriptedAdapter::new()
            .with_context_window(100)
            .with_rounds(vec![ScriptedRound::text(&["reply"]).with_usage(95, 1)]);
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(RecordingExecutor::new()))
            .history(vec![Message::user("a"), Message::assistant("b"), Message::user("c")])
            .context_settings(ContextSettings { enabled: true, threshold_percent: 80, keep_recent: 1 })
            .build()
            .unwrap();

        let outcome = orch.process_query("d", Vec::new()).await.unwrap();

        assert!(outcome.compaction.is_none());
        let last = orch.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.is_synthetic());
        assert_eq!(orch.messages().len(), 6);
    }

    #[tokio::test]
    async fn test_max_iterations_is_reported() {
        let adapter = ScriptedAdapter::new().with_rounds(vec![
            ScriptedRound::tool("t1", "alpha__search"),
            ScriptedRound::tool("t2", "alpha__search"),
            ScriptedRound::text(&["unreachable"]),
        ]);
        let mut orch = Orchestrator::builder()
            .adapter(Arc::new(adapter))
            .executor(Arc::new(RecordingExecutor::new()))
            .iterations(Iterations::Limited(2))
            .build()
            .unwrap();

        let outcome = orch.process_query("loop", Vec::new()).await.unwrap();

        assert_eq!(outcome.stop, TurnStop::MaxIterations);
        assert_eq!(outcome.tool_calls, 2);
        assert!(orch.messages().last().unwrap().is_synthetic());
    }
}
