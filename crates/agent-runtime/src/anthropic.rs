//! Anthropic Messages API Adapter
//!
//! Reference implementation of [`ProviderAdapter`]: streams `/v1/messages`
//! over server-sent events, translates every native event 1:1 into the
//! canonical vocabulary and runs the tool-use loop until the model stops
//! asking for tools.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agent_core::{
    control::Canceller,
    error::{AgentError, Result},
    event::{BlockDelta, BlockStart, StreamEvent, TokenUsage},
    message::{ContentBlock, Message, Role, ToolResultPairing},
    provider::{
        CompletionRequest, EventSink, EventStream, PendingToolCall, ProviderAdapter, StreamRequest,
        execute_tool_calls,
    },
    tool::{ToolExecutor, ToolSpec},
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::http::{self, HttpFailure, SseReader};

const API_VERSION: &str = "2023-06-01";

/// Anthropic provider configuration
#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    /// Extended-thinking budget; `None` disables reasoning
    pub thinking_budget: Option<u32>,
    pub timeout_secs: u64,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
            thinking_budget: None,
            timeout_secs: 600,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AgentError::Config("ANTHROPIC_API_KEY is not set".into()))?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
            config.base_url = url;
        }
        config.thinking_budget = std::env::var("ANTHROPIC_THINKING_BUDGET")
            .ok()
            .and_then(|b| b.parse().ok());
        Ok(config)
    }

    #[must_use]
    pub const fn with_thinking(mut self, budget: u32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }
}

/// Anthropic backend
pub struct AnthropicAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    config: AnthropicConfig,
    /// Cleared once a model rejects the thinking parameter
    thinking_supported: AtomicBool,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let http = http::build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                thinking_supported: AtomicBool::new(true),
            }),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(AnthropicConfig::from_env()?)
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post(&self, path: &str, body: &Value) -> std::result::Result<reqwest::Response, HttpFailure> {
        let response = self
            .http
            .post(self.url(path))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| HttpFailure {
                status: 0,
                body: http::transport_error(&e).to_string(),
            })?;
        http::split_status(response).await
    }

    fn thinking_budget(&self) -> Option<u32> {
        self.config
            .thinking_budget
            .filter(|_| self.thinking_supported.load(Ordering::Relaxed))
    }

    /// Open one streaming round. A rejected `thinking` parameter becomes
    /// [`AgentError::CapabilityRejected`].
    async fn open_round(
        &self,
        request: &StreamRequest,
        history: &[Message],
        thinking: Option<u32>,
    ) -> Result<reqwest::Response> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_output_tokens,
            "messages": to_native(history, thinking.is_some()),
            "stream": true,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = native_tools(&request.tools);
        }
        if let Some(budget) = thinking {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            body["max_tokens"] = json!(request.max_output_tokens.max(budget + 1024));
        }

        match self.post("/v1/messages", &body).await {
            Ok(response) => Ok(response),
            Err(failure) if failure.status == 0 => Err(AgentError::ProviderUnavailable(failure.body)),
            Err(failure) if thinking.is_some() && is_thinking_rejection(&failure) => {
                Err(AgentError::CapabilityRejected(failure.body))
            }
            Err(failure) => Err(failure.into_error()),
        }
    }

    async fn drive(
        &self,
        request: StreamRequest,
        executor: Arc<dyn ToolExecutor>,
        canceller: Arc<dyn Canceller>,
        sink: &EventSink,
    ) -> Result<()> {
        let mut history = request.messages.clone();
        let mut thinking = self.thinking_budget();

        for round in 0..request.max_iterations {
            if canceller.is_cancelled() {
                debug!(round, "Cancelled before backend round-trip");
                return Ok(());
            }

            let response = match self.open_round(&request, &history, thinking).await {
                Err(AgentError::CapabilityRejected(reason)) => {
                    warn!(model = %request.model, %reason, "Model rejected extended thinking; retrying without it");
                    self.thinking_supported.store(false, Ordering::Relaxed);
                    thinking = None;
                    strip_reasoning(&mut history);
                    sink.emit(StreamEvent::client_info(format!(
                        "{} does not support extended thinking; continuing without it",
                        request.model
                    )))
                    .await;
                    self.open_round(&request, &history, None).await?
                }
                other => other?,
            };

            let mut state = RoundState::new(round);
            let mut reader = SseReader::new(response);
            while let Some(data) = reader.next_data().await? {
                let event: NativeEvent = match serde_json::from_str(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "Skipping unparseable SSE payload");
                        continue;
                    }
                };
                let stop = matches!(event, NativeEvent::MessageStop);
                for canonical in state.apply(event)? {
                    if !sink.emit(canonical).await {
                        return Ok(());
                    }
                }
                if stop {
                    break;
                }
            }

            let finished = state.finish();
            sink.emit(StreamEvent::TokenUsage(finished.usage)).await;

            if finished.calls.is_empty() {
                sink.emit(StreamEvent::MessageStop {
                    stop_reason: finished.stop_reason,
                })
                .await;
                return Ok(());
            }

            let Some(results) =
                execute_tool_calls(&finished.calls, executor.as_ref(), canceller.as_ref(), sink).await
            else {
                return Ok(());
            };
            sink.emit(StreamEvent::MessageStop {
                stop_reason: Some("tool_use".into()),
            })
            .await;

            history.push(Message::assistant_blocks(finished.blocks));
            history.push(Message::tool_results(
                finished
                    .calls
                    .iter()
                    .zip(&results)
                    .map(|(call, result)| result.to_block(&call.id))
                    .collect(),
            ));
        }

        info!(iterations = request.max_iterations, "Tool-use loop hit its iteration bound");
        sink.emit(StreamEvent::MaxIterationsReached {
            iterations: request.max_iterations,
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn pairing(&self) -> ToolResultPairing {
        ToolResultPairing::ById
    }

    fn context_window(&self, _model: &str) -> u64 {
        200_000
    }

    async fn stream_with_tools(
        &self,
        request: StreamRequest,
        executor: Arc<dyn ToolExecutor>,
        canceller: Arc<dyn Canceller>,
    ) -> Result<EventStream> {
        let (sink, stream) = EventSink::channel(64);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.drive(request, executor, canceller, &sink).await {
                sink.fail(e).await;
            }
        });
        Ok(stream)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_output_tokens,
            "messages": to_native(&request.messages, false),
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let response = self.inner.post("/v1/messages", &body).await.map_err(HttpFailure::into_error)?;
        let value: Value = response.json().await.map_err(|e| http::transport_error(&e))?;
        let text = value["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
    }

    async fn count_tokens(&self, request: &StreamRequest) -> Result<Option<u64>> {
        let mut body = json!({
            "model": request.model,
            "messages": to_native(&request.messages, false),
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = native_tools(&request.tools);
        }

        let response = self
            .inner
            .post("/v1/messages/count_tokens", &body)
            .await
            .map_err(HttpFailure::into_error)?;
        let value: Value = response.json().await.map_err(|e| http::transport_error(&e))?;
        Ok(value.get("input_tokens").and_then(Value::as_u64))
    }
}

fn is_thinking_rejection(failure: &HttpFailure) -> bool {
    failure.status == 400 && failure.body.to_ascii_lowercase().contains("thinking")
}

/// Remove reasoning blocks, and assistant turns left empty by that
fn strip_reasoning(history: &mut Vec<Message>) {
    for message in history.iter_mut() {
        message
            .blocks
            .retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
    }
    history.retain(|m| !(m.role == Role::Assistant && m.blocks.is_empty() && m.content.is_empty()));
}

fn native_tools(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect(),
    )
}

fn native_block(block: &ContentBlock, with_thinking: bool) -> Option<Value> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::Image { media_type, data } => Some(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        })),
        ContentBlock::Document { media_type, data, .. } => Some(json!({
            "type": "document",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        })),
        ContentBlock::ToolUse { id, name, input } => Some(json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        })),
        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
            let content: Vec<Value> = content.iter().filter_map(|b| native_block(b, false)).collect();
            Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }))
        }
        // Reasoning can only be replayed with its signature.
        ContentBlock::Thinking { thinking, signature: Some(signature) } if with_thinking => Some(json!({
            "type": "thinking", "thinking": thinking, "signature": signature,
        })),
        ContentBlock::Thinking { .. } => None,
    }
}

/// Canonical history to native messages. Tool results travel as user
/// content; consecutive messages of one role are merged.
fn to_native(messages: &[Message], with_thinking: bool) -> Vec<Value> {
    let mut native: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };

        let mut content = Vec::new();
        let has_text_block = message.blocks.iter().any(|b| matches!(b, ContentBlock::Text { .. }));
        if !message.content.is_empty() && (message.role == Role::User || !has_text_block) && message.role != Role::Tool {
            content.push(json!({ "type": "text", "text": message.content }));
        }
        for block in &message.blocks {
            if message.role == Role::User && matches!(block, ContentBlock::Text { .. }) && !message.content.is_empty() {
                continue;
            }
            content.extend(native_block(block, with_thinking));
        }
        if content.is_empty() {
            continue;
        }

        match native.last_mut() {
            Some((last_role, last)) if *last_role == role => last.extend(content),
            _ => native.push((role, content)),
        }
    }

    native
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeEvent {
    MessageStart {
        message: NativeMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: NativeBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: NativeDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        delta: NativeMessageDelta,
        #[serde(default)]
        usage: Option<NativeUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: NativeError,
    },
}

#[derive(Debug, Deserialize)]
struct NativeMessageStart {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<NativeUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct NativeMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NativeUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NativeError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
enum Accumulated {
    Text { text: String },
    Thinking { thinking: String, signature: Option<String> },
    Tool { id: String, name: String, json: String },
}

#[derive(Debug)]
struct FinishedRound {
    blocks: Vec<ContentBlock>,
    calls: Vec<PendingToolCall>,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

/// Native events of one round-trip, folded into canonical events and the
/// assistant turn to replay in the next request
#[derive(Debug)]
struct RoundState {
    round: usize,
    blocks: BTreeMap<usize, Accumulated>,
    usage: TokenUsage,
    stop_reason: Option<String>,
}

impl RoundState {
    fn new(round: usize) -> Self {
        Self {
            round,
            blocks: BTreeMap::new(),
            usage: TokenUsage::default(),
            stop_reason: None,
        }
    }

    fn block_id(&self, index: usize) -> String {
        match self.blocks.get(&index) {
            Some(Accumulated::Tool { id, .. }) => id.clone(),
            _ => format!("r{}b{index}", self.round),
        }
    }

    fn update_usage(&mut self, usage: &NativeUsage) {
        if let Some(n) = usage.input_tokens {
            self.usage.input_tokens = n;
        }
        if let Some(n) = usage.output_tokens {
            self.usage.output_tokens = n;
        }
        if let Some(n) = usage.cache_creation_input_tokens {
            self.usage.cache_write_tokens = n;
        }
        if let Some(n) = usage.cache_read_input_tokens {
            self.usage.cache_read_tokens = n;
        }
    }

    fn apply(&mut self, event: NativeEvent) -> Result<Vec<StreamEvent>> {
        let mut out = Vec::new();
        match event {
            NativeEvent::MessageStart { message } => {
                if let Some(usage) = &message.usage {
                    self.update_usage(usage);
                }
                out.push(StreamEvent::MessageStart { model: message.model });
            }
            NativeEvent::ContentBlockStart { index, content_block } => {
                let (accumulated, kind, initial) = match content_block {
                    NativeBlock::Text { text } => (
                        Accumulated::Text { text: String::new() },
                        BlockStart::Text,
                        (!text.is_empty()).then(|| BlockDelta::Text(text)),
                    ),
                    NativeBlock::Thinking { thinking, signature } => (
                        Accumulated::Thinking {
                            thinking: String::new(),
                            signature,
                        },
                        BlockStart::Thinking,
                        (!thinking.is_empty()).then(|| BlockDelta::Thinking(thinking)),
                    ),
                    NativeBlock::ToolUse { id, name } => (
                        Accumulated::Tool {
                            id,
                            name: name.clone(),
                            json: String::new(),
                        },
                        BlockStart::ToolUse { name },
                        None,
                    ),
                    NativeBlock::Other => return Ok(out),
                };
                self.blocks.insert(index, accumulated);
                let id = self.block_id(index);
                out.push(StreamEvent::ContentBlockStart { id, block: kind });
                if let Some(delta) = initial {
                    out.extend(self.apply_delta(index, delta));
                }
            }
            NativeEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    NativeDelta::TextDelta { text } => BlockDelta::Text(text),
                    NativeDelta::ThinkingDelta { thinking } => BlockDelta::Thinking(thinking),
                    NativeDelta::SignatureDelta { signature } => BlockDelta::ThinkingSignature(signature),
                    NativeDelta::InputJsonDelta { partial_json } => BlockDelta::ToolInputJson(partial_json),
                    NativeDelta::Other => return Ok(out),
                };
                out.extend(self.apply_delta(index, delta));
            }
            NativeEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = &usage {
                    self.update_usage(usage);
                }
            }
            NativeEvent::ContentBlockStop { .. } | NativeEvent::MessageStop | NativeEvent::Ping => {}
            NativeEvent::Error { error } => {
                return Err(if error.kind == "overloaded_error" {
                    AgentError::ProviderUnavailable(error.message)
                } else {
                    AgentError::Provider(format!("{}: {}", error.kind, error.message))
                });
            }
        }
        Ok(out)
    }

    fn apply_delta(&mut self, index: usize, delta: BlockDelta) -> Option<StreamEvent> {
        let id = self.block_id(index);
        match (self.blocks.get_mut(&index)?, &delta) {
            (Accumulated::Text { text }, BlockDelta::Text(fragment)) => text.push_str(fragment),
            (Accumulated::Thinking { thinking, .. }, BlockDelta::Thinking(fragment)) => thinking.push_str(fragment),
            (Accumulated::Thinking { signature, .. }, BlockDelta::ThinkingSignature(s)) => {
                *signature = Some(s.clone());
            }
            (Accumulated::Tool { json, .. }, BlockDelta::ToolInputJson(fragment)) => json.push_str(fragment),
            _ => return None,
        }
        Some(StreamEvent::ContentBlockDelta { id, delta })
    }

    fn finish(self) -> FinishedRound {
        let mut blocks = Vec::new();
        let mut calls = Vec::new();
        for block in self.blocks.into_values() {
            match block {
                Accumulated::Text { text } => {
                    if !text.is_empty() {
                        blocks.push(ContentBlock::text(text));
                    }
                }
                Accumulated::Thinking { thinking, signature } => {
                    blocks.push(ContentBlock::Thinking { thinking, signature });
                }
                Accumulated::Tool { id, name, json } => {
                    let call = PendingToolCall::from_fragments(id, name, &json);
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                    calls.push(call);
                }
            }
        }
        FinishedRound {
            blocks,
            calls,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}
