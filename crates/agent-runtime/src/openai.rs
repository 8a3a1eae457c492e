//! OpenAI-compatible Chat Completions Adapter
//!
//! Works against OpenAI and any server exposing `/chat/completions` with
//! streaming tool calls. Tool results are sent as sibling `tool` messages
//! keyed by call id.

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

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".into(),
            timeout_secs: 600,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::Config("OPENAI_API_KEY is not set".into()))?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

pub struct OpenAiAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    config: OpenAiConfig,
    /// Set once the backend refuses images inside tool messages
    tool_images_rejected: AtomicBool,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let http = http::build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                tool_images_rejected: AtomicBool::new(false),
            }),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiConfig::from_env()?)
    }
}

impl Inner {
    async fn post(&self, body: &Value) -> std::result::Result<reqwest::Response, HttpFailure> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| HttpFailure {
                status: 0,
                body: http::transport_error(&e).to_string(),
            })?;
        http::split_status(response).await
    }

    async fn open_round(
        &self,
        request: &StreamRequest,
        history: &[Message],
        inline_images: bool,
    ) -> std::result::Result<reqwest::Response, HttpFailure> {
        let mut body = json!({
            "model": request.model,
            "messages": to_native(request.system.as_deref(), history, inline_images),
            "max_tokens": request.max_output_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !request.tools.is_empty() {
            body["tools"] = native_tools(&request.tools);
        }
        self.post(&body).await
    }

    async fn drive(
        &self,
        request: StreamRequest,
        executor: Arc<dyn ToolExecutor>,
        canceller: Arc<dyn Canceller>,
        sink: &EventSink,
    ) -> Result<()> {
        let mut history = request.messages.clone();

        for round in 0..request.max_iterations {
            if canceller.is_cancelled() {
                debug!(round, "Cancelled before backend round-trip");
                return Ok(());
            }

            let inline_images = !self.tool_images_rejected.load(Ordering::Relaxed);
            let response = match self.open_round(&request, &history, inline_images).await {
                Ok(response) => response,
                Err(failure) if inline_images && has_tool_images(&history) && is_image_rejection(&failure) => {
                    warn!(model = %request.model, "Backend rejected images in tool results; resending as user content");
                    self.tool_images_rejected.store(true, Ordering::Relaxed);
                    sink.emit(StreamEvent::client_info(format!(
                        "{} does not accept images in tool results; sending them as a follow-up message instead",
                        request.model
                    )))
                    .await;
                    self.open_round(&request, &history, false)
                        .await
                        .map_err(HttpFailure::into_error)?
                }
                Err(failure) if failure.status == 0 => return Err(AgentError::ProviderUnavailable(failure.body)),
                Err(failure) => return Err(failure.into_error()),
            };

            let mut state = RoundState::new(round);
            let mut reader = SseReader::new(response);
            while let Some(data) = reader.next_data().await? {
                if data.trim() == "[DONE]" {
                    break;
                }
                let chunk: Chunk = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "Skipping non-chunk SSE payload");
                        continue;
                    }
                };
                for event in state.apply(chunk)? {
                    if !sink.emit(event).await {
                        return Ok(());
                    }
                }
            }

            let finished = state.finish();
            if let Some(usage) = finished.usage {
                sink.emit(StreamEvent::TokenUsage(usage)).await;
            }

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
                stop_reason: Some("tool_calls".into()),
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
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn pairing(&self) -> ToolResultPairing {
        ToolResultPairing::ById
    }

    fn context_window(&self, model: &str) -> u64 {
        if model.starts_with("gpt-4.1") {
            1_000_000
        } else if model.starts_with("gpt-3.5") {
            16_385
        } else {
            128_000
        }
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
        let body = json!({
            "model": request.model,
            "messages": to_native(request.system.as_deref(), &request.messages, false),
            "max_tokens": request.max_output_tokens,
        });
        let response = self.inner.post(&body).await.map_err(HttpFailure::into_error)?;
        let value: Value = response.json().await.map_err(|e| http::transport_error(&e))?;
        Ok(value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

fn is_image_rejection(failure: &HttpFailure) -> bool {
    let body = failure.body.to_ascii_lowercase();
    (400..500).contains(&failure.status) && (body.contains("image") || body.contains("image_url"))
}

fn has_tool_images(history: &[Message]) -> bool {
    history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .flat_map(|m| m.blocks.iter())
        .any(|b| matches!(b, ContentBlock::ToolResult { content, .. } if content.iter().any(ContentBlock::is_image)))
}

fn native_tools(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect(),
    )
}

fn image_part(media_type: &str, data: &str) -> Value {
    json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{media_type};base64,{data}") },
    })
}

fn user_content(message: &Message) -> Value {
    let images: Vec<Value> = message
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Image { media_type, data } => Some(image_part(media_type, data)),
            _ => None,
        })
        .collect();
    let text = message.text();
    if images.is_empty() {
        return json!(text);
    }
    let mut parts = vec![json!({ "type": "text", "text": text })];
    parts.extend(images);
    Value::Array(parts)
}

/// Canonical history to chat messages. Each tool result becomes its own
/// `tool` message. Without `inline_images`, result images are replaced by a
/// note and re-sent in one user message after the tool messages.
fn to_native(system: Option<&str>, messages: &[Message], inline_images: bool) -> Vec<Value> {
    let mut native = Vec::new();
    if let Some(system) = system {
        native.push(json!({ "role": "system", "content": system }));
    }

    for message in messages {
        match message.role {
            Role::User => native.push(json!({ "role": "user", "content": user_content(message) })),
            Role::Assistant => {
                let tool_calls: Vec<Value> = message
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() },
                        })),
                        _ => None,
                    })
                    .collect();
                let text = message.text();
                let mut entry = json!({ "role": "assistant", "content": if text.is_empty() { Value::Null } else { json!(text) } });
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                native.push(entry);
            }
            Role::Tool => {
                let mut deferred = Vec::new();
                for block in &message.blocks {
                    let ContentBlock::ToolResult { tool_use_id, content, .. } = block else {
                        continue;
                    };
                    let text: String = content
                        .iter()
                        .filter(|b| !b.is_image())
                        .map(ContentBlock::plain_text)
                        .collect::<Vec<_>>()
                        .join("\n");
                    let images: Vec<Value> = content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Image { media_type, data } => Some(image_part(media_type, data)),
                            _ => None,
                        })
                        .collect();

                    let content = if images.is_empty() {
                        json!(text)
                    } else if inline_images {
                        let mut parts = vec![json!({ "type": "text", "text": text })];
                        parts.extend(images);
                        Value::Array(parts)
                    } else {
                        deferred.extend(images);
                        json!(format!("{text}\n[image output attached in the next message]"))
                    };
                    native.push(json!({ "role": "tool", "tool_call_id": tool_use_id, "content": content }));
                }
                if !deferred.is_empty() {
                    let mut parts = vec![json!({ "type": "text", "text": "Images returned by the previous tool call(s):" })];
                    parts.extend(deferred);
                    native.push(json!({ "role": "user", "content": parts }));
                }
            }
        }
    }
    native
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Default)]
struct ToolAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
struct FinishedRound {
    blocks: Vec<ContentBlock>,
    calls: Vec<PendingToolCall>,
    usage: Option<TokenUsage>,
    stop_reason: Option<String>,
}

#[derive(Debug)]
struct RoundState {
    round: usize,
    started: bool,
    text: Option<String>,
    reasoning: Option<String>,
    tools: BTreeMap<usize, ToolAccumulator>,
    usage: Option<TokenUsage>,
    stop_reason: Option<String>,
}

impl RoundState {
    const fn new(round: usize) -> Self {
        Self {
            round,
            started: false,
            text: None,
            reasoning: None,
            tools: BTreeMap::new(),
            usage: None,
            stop_reason: None,
        }
    }

    fn apply(&mut self, chunk: Chunk) -> Result<Vec<StreamEvent>> {
        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), ToString::to_string);
            return Err(AgentError::Provider(message));
        }

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart { model: chunk.model });
        }

        if let Some(usage) = chunk.usage {
            let cached = usage.prompt_tokens_details.map_or(0, |d| d.cached_tokens);
            self.usage = Some(TokenUsage {
                input_tokens: usage.prompt_tokens.saturating_sub(cached),
                output_tokens: usage.completion_tokens,
                cache_read_tokens: cached,
                cache_write_tokens: 0,
            });
        }

        for choice in chunk.choices {
            if choice.finish_reason.is_some() {
                self.stop_reason = choice.finish_reason;
            }
            let delta = choice.delta;

            if let Some(fragment) = delta.reasoning_content.filter(|s| !s.is_empty()) {
                let id = format!("r{}-reasoning", self.round);
                if self.reasoning.is_none() {
                    out.push(StreamEvent::ContentBlockStart { id: id.clone(), block: BlockStart::Thinking });
                }
                self.reasoning.get_or_insert_with(String::new).push_str(&fragment);
                out.push(StreamEvent::ContentBlockDelta { id, delta: BlockDelta::Thinking(fragment) });
            }

            if let Some(fragment) = delta.content.filter(|s| !s.is_empty()) {
                let id = format!("r{}-text", self.round);
                if self.text.is_none() {
                    out.push(StreamEvent::ContentBlockStart { id: id.clone(), block: BlockStart::Text });
                }
                self.text.get_or_insert_with(String::new).push_str(&fragment);
                out.push(StreamEvent::text_delta(id, fragment));
            }

            for call in delta.tool_calls {
                let function = call.function.unwrap_or_default();
                let fresh = !self.tools.contains_key(&call.index);
                let entry = self.tools.entry(call.index).or_default();
                if let Some(id) = call.id {
                    entry.id = id;
                }
                if let Some(name) = function.name {
                    entry.name.push_str(&name);
                }
                if entry.id.is_empty() {
                    entry.id = format!("call_r{}_{}", self.round, call.index);
                }
                if fresh {
                    out.push(StreamEvent::ContentBlockStart {
                        id: entry.id.clone(),
                        block: BlockStart::ToolUse { name: entry.name.clone() },
                    });
                }
                if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                    entry.arguments.push_str(&arguments);
                    out.push(StreamEvent::ContentBlockDelta {
                        id: entry.id.clone(),
                        delta: BlockDelta::ToolInputJson(arguments),
                    });
                }
            }
        }
        Ok(out)
    }

    fn finish(self) -> FinishedRound {
        let mut blocks = Vec::new();
        if let Some(reasoning) = self.reasoning {
            blocks.push(ContentBlock::Thinking { thinking: reasoning, signature: None });
        }
        if let Some(text) = self.text {
            blocks.push(ContentBlock::text(text));
        }
        let calls: Vec<PendingToolCall> = self
            .tools
            .into_values()
            .map(|t| PendingToolCall::from_fragments(t.id, t.name, &t.arguments))
            .collect();
        blocks.extend(calls.iter().map(|c| ContentBlock::ToolUse {
            id: c.id.clone(),
            name: c.name.clone(),
            input: c.input.clone(),
        }));
        FinishedRound {
            blocks,
            calls,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}
