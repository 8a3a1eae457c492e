//! Scripted fakes for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::control::{CancelFlag, Canceller};
use crate::error::{AgentError, Result};
use crate::event::{BlockDelta, BlockStart, StreamEvent, TokenUsage};
use crate::message::{ContentBlock, Message, ToolResultPairing};
use crate::observer::{ChatLog, ToolExecutionRecord};
use crate::provider::{
    CompletionRequest, EventSink, EventStream, PendingToolCall, ProviderAdapter, StreamRequest,
    execute_tool_calls,
};
use crate::tool::{ToolExecutionResult, ToolExecutor, ToolSpec};

/// One scripted backend round-trip
#[derive(Clone, Debug, Default)]
pub struct ScriptedRound {
    pub text_deltas: Vec<String>,
    pub tool_calls: Vec<PendingToolCall>,
    pub usage: Option<TokenUsage>,
    /// Deliver the turn as one `complete_response` instead of block deltas
    pub atomic: bool,
}

impl ScriptedRound {
    pub fn text(deltas: &[&str]) -> Self {
        Self {
            text_deltas: deltas.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn tool(id: &str, name: &str) -> Self {
        Self {
            tool_calls: vec![PendingToolCall {
                id: id.into(),
                name: name.into(),
                input: serde_json::json!({"id": id}),
            }],
            ..Self::default()
        }
    }

    pub fn tool_with(id: &str, name: &str, input: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![PendingToolCall {
                id: id.into(),
                name: name.into(),
                input,
            }],
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
            ..TokenUsage::default()
        });
        self
    }

    pub const fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }
}

struct AdapterState {
    rounds: Mutex<VecDeque<ScriptedRound>>,
    requests: Mutex<Vec<StreamRequest>>,
    round_trips: AtomicUsize,
    summary: Option<String>,
    pairing: ToolResultPairing,
    context_window: u64,
    exact_count: Option<u64>,
}

/// Adapter that replays scripted rounds through the shared tool loop
#[derive(Clone)]
pub struct ScriptedAdapter {
    state: Arc<AdapterState>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AdapterState {
                rounds: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                round_trips: AtomicUsize::new(0),
                summary: None,
                pairing: ToolResultPairing::ById,
                context_window: 100_000,
                exact_count: None,
            }),
        }
    }

    fn configure(self, f: impl FnOnce(&mut AdapterState)) -> Self {
        let mut state = Arc::try_unwrap(self.state).unwrap_or_else(|_| panic!("adapter shared"));
        f(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn with_rounds(self, rounds: Vec<ScriptedRound>) -> Self {
        self.configure(|s| s.rounds = Mutex::new(rounds.into()))
    }

    pub fn with_summary(self, summary: &str) -> Self {
        let summary = summary.to_string();
        self.configure(|s| s.summary = Some(summary))
    }

    pub fn with_pairing(self, pairing: ToolResultPairing) -> Self {
        self.configure(|s| s.pairing = pairing)
    }

    pub fn with_context_window(self, window: u64) -> Self {
        self.configure(|s| s.context_window = window)
    }

    pub fn with_exact_count(self, count: u64) -> Self {
        self.configure(|s| s.exact_count = Some(count))
    }

    pub fn round_trips(&self) -> usize {
        self.state.round_trips.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    async fn run(
        state: Arc<AdapterState>,
        request: StreamRequest,
        executor: Arc<dyn ToolExecutor>,
        canceller: Arc<dyn Canceller>,
        sink: EventSink,
    ) {
        for iteration in 0..request.max_iterations {
            if canceller.is_cancelled() {
                return;
            }
            let Some(round) = state.rounds.lock().unwrap().pop_front() else {
                return;
            };
            state.round_trips.fetch_add(1, Ordering::SeqCst);

            sink.emit(StreamEvent::MessageStart { model: Some(request.model.clone()) }).await;
            if round.atomic {
                let mut blocks = vec![ContentBlock::text(round.text_deltas.concat())];
                blocks.extend(round.tool_calls.iter().map(|c| ContentBlock::ToolUse {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    input: c.input.clone(),
                }));
                sink.emit(StreamEvent::CompleteResponse { blocks }).await;
            } else {
                let text_id = format!("text-{iteration}");
                sink.emit(StreamEvent::ContentBlockStart { id: text_id.clone(), block: BlockStart::Text })
                    .await;
                for delta in &round.text_deltas {
                    sink.emit(StreamEvent::text_delta(&text_id, delta)).await;
                }
                for call in &round.tool_calls {
                    sink.emit(StreamEvent::ContentBlockStart {
                        id: call.id.clone(),
                        block: BlockStart::ToolUse { name: call.name.clone() },
                    })
                    .await;
                    sink.emit(StreamEvent::ContentBlockDelta {
                        id: call.id.clone(),
                        delta: BlockDelta::ToolInputJson(call.input.to_string()),
                    })
                    .await;
                }
            }
            if let Some(usage) = round.usage {
                sink.emit(StreamEvent::TokenUsage(usage)).await;
            }

            if round.tool_calls.is_empty() {
                sink.emit(StreamEvent::MessageStop { stop_reason: Some("end_turn".into()) }).await;
                return;
            }
            if execute_tool_calls(&round.tool_calls, executor.as_ref(), canceller.as_ref(), &sink)
                .await
                .is_none()
            {
                return;
            }
            sink.emit(StreamEvent::MessageStop { stop_reason: Some("tool_use".into()) }).await;
        }
        sink.emit(StreamEvent::MaxIterationsReached { iterations: request.max_iterations })
            .await;
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn pairing(&self) -> ToolResultPairing {
        self.state.pairing
    }

    fn context_window(&self, _model: &str) -> u64 {
        self.state.context_window
    }

    async fn stream_with_tools(
        &self,
        request: StreamRequest,
        executor: Arc<dyn ToolExecutor>,
        canceller: Arc<dyn Canceller>,
    ) -> Result<EventStream> {
        self.state.requests.lock().unwrap().push(request.clone());
        let (sink, stream) = EventSink::channel(64);
        let state = Arc::clone(&self.state);
        tokio::spawn(Self::run(state, request, executor, canceller, sink));
        Ok(stream)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        self.state
            .summary
            .clone()
            .ok_or_else(|| AgentError::Provider("summary backend offline".into()))
    }

    async fn count_tokens(&self, _request: &StreamRequest) -> Result<Option<u64>> {
        Ok(self.state.exact_count)
    }
}

type CallHook = Box<dyn Fn(&str) + Send + Sync>;

/// Executor that records calls and answers `"<name> ok"`
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    cancel_on: Option<(String, CancelFlag)>,
    hook: Option<CallHook>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation while `tool` is running
    pub fn cancel_on(mut self, tool: &str, flag: CancelFlag) -> Self {
        self.cancel_on = Some((tool.to_string(), flag));
        self
    }

    pub fn on_call(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn available_tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec::new("alpha", "search", "Search", serde_json::json!({"type": "object"}))]
    }

    async fn execute(&self, name: &str, input: serde_json::Value) -> ToolExecutionResult {
        self.calls.lock().unwrap().push((name.to_string(), input));
        if let Some(hook) = &self.hook {
            hook(name);
        }
        if let Some((tool, flag)) = &self.cancel_on {
            if tool == name {
                flag.cancel();
            }
        }
        ToolExecutionResult::text(format!("{name} ok"))
    }
}

/// Chat log keeping a flat, ordered trace
#[derive(Default)]
pub struct RecordingChatLog {
    entries: Mutex<Vec<String>>,
}

impl RecordingChatLog {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }
}

impl ChatLog for RecordingChatLog {
    fn user_message_added(&self, message: &Message) {
        self.push(format!("user:{}", message.text()));
    }

    fn assistant_message_added(&self, message: &Message) {
        self.push(format!("assistant:{}", message.text()));
    }

    fn tool_execution_added(&self, record: &ToolExecutionRecord) {
        self.push(format!("tool:{}", record.name));
    }

    fn token_usage(&self, usage: &TokenUsage) {
        self.push(format!("usage:{}", usage.total()));
    }
}
