//! Ollama Adapter
//!
//! Local inference through Ollama. `/api/chat` streams newline-delimited
//! JSON; tool calls arrive whole rather than as argument fragments, so each
//! round closes with a `complete_response` event carrying the full assistant
//! turn. Results pair with their invocations by position.

use std::sync::Arc;
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
use ollama_rs::{
    Ollama,
    generation::chat::{ChatMessage, MessageRole, request::ChatMessageRequest},
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::http::{self, HttpFailure, NdjsonReader};

/// Context window assumed when `OLLAMA_NUM_CTX` is not set
pub const DEFAULT_NUM_CTX: u64 = 8192;

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Context-window cap passed as `options.num_ctx`
    pub num_ctx: Option<u64>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            timeout_secs: 600,
            num_ctx: None,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost".into());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);
        let num_ctx = std::env::var("OLLAMA_NUM_CTX").ok().and_then(|n| n.parse().ok());

        Self {
            host,
            port,
            num_ctx,
            ..Default::default()
        }
    }

    fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

/// Ollama provider adapter
pub struct OllamaAdapter {
    client: Ollama,
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaAdapter {
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        let http = http::build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            client: Ollama::new(config.host.clone(), config.port),
            inner: Arc::new(Inner { http, config }),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }

    pub async fn health_check(&self) -> bool {
        match self.client.list_local_models().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Ollama health check failed: {}", e);
                false
            }
        }
    }

    /// Names of locally installed models
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(e.to_string()))?;
        Ok(models.into_iter().map(|m| m.name).collect())
    }
}

impl Inner {
    async fn open_round(
        &self,
        request: &StreamRequest,
        history: &[Message],
    ) -> std::result::Result<reqwest::Response, HttpFailure> {
        let mut body = json!({
            "model": request.model,
            "messages": to_native(request.system.as_deref(), history),
            "stream": true,
            "options": { "num_predict": request.max_output_tokens },
        });
        if let Some(num_ctx) = self.config.num_ctx {
            body["options"]["num_ctx"] = json!(num_ctx);
        }
        if !request.tools.is_empty() {
            body["tools"] = native_tools(&request.tools);
        }

        let response = self
            .http
            .post(format!("{}/api/chat", self.config.base_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| HttpFailure {
                status: 0,
                body: http::transport_error(&e).to_string(),
            })?;
        http::split_status(response).await
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

            let response = match self.open_round(&request, &history).await {
                Ok(response) => response,
                Err(failure) if failure.status == 0 => {
                    return Err(AgentError::ProviderUnavailable(failure.body));
                }
                Err(failure) => return Err(failure.into_error()),
            };

            let mut state = RoundState::new(round);
            let mut reader = NdjsonReader::new(response);
            while let Some(value) = reader.next_value().await? {
                for event in state.apply(&value)? {
                    if !sink.emit(event).await {
                        return Ok(());
                    }
                }
            }

            let finished = state.finish();
            sink.emit(StreamEvent::CompleteResponse {
                blocks: finished.blocks.clone(),
            })
            .await;
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
            for (call, result) in finished.calls.iter().zip(&results) {
                history.push(Message::tool_result_for(&call.id, result.to_block(&call.id)));
            }
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
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn pairing(&self) -> ToolResultPairing {
        ToolResultPairing::ByPosition
    }

    fn context_window(&self, _model: &str) -> u64 {
        self.inner.config.num_ctx.unwrap_or(DEFAULT_NUM_CTX)
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
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system {
            messages.push(ChatMessage::new(MessageRole::System, system));
        }
        messages.extend(request.messages.iter().map(|m| {
            let role = match m.role {
                Role::User | Role::Tool => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
            };
            ChatMessage::new(role, m.text())
        }));

        let response = self
            .client
            .send_chat_messages(ChatMessageRequest::new(request.model, messages))
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;
        Ok(response.message.content)
    }
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

fn images_of(blocks: &[ContentBlock]) -> Vec<String> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Image { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// Canonical history to Ollama chat messages; one `tool` message per result,
/// in invocation order.
fn to_native(system: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut native = Vec::new();
    if let Some(system) = system {
        native.push(json!({ "role": "system", "content": system }));
    }

    for message in messages {
        match message.role {
            Role::User => {
                let mut entry = json!({ "role": "user", "content": message.text() });
                let images = images_of(&message.blocks);
                if !images.is_empty() {
                    entry["images"] = json!(images);
                }
                native.push(entry);
            }
            Role::Assistant => {
                let mut entry = json!({ "role": "assistant", "content": message.text() });
                let calls: Vec<Value> = message
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { name, input, .. } => {
                            Some(json!({ "function": { "name": name, "arguments": input } }))
                        }
                        _ => None,
                    })
                    .collect();
                if !calls.is_empty() {
                    entry["tool_calls"] = Value::Array(calls);
                }
                native.push(entry);
            }
            Role::Tool => {
                for block in &message.blocks {
                    let ContentBlock::ToolResult { content, .. } = block else {
                        continue;
                    };
                    let mut entry = json!({ "role": "tool", "content": block.plain_text() });
                    let images = images_of(content);
                    if !images.is_empty() {
                        entry["images"] = json!(images);
                    }
                    native.push(entry);
                }
            }
        }
    }
    native
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
    thinking: Option<String>,
    calls: Vec<PendingToolCall>,
    usage: Option<TokenUsage>,
    stop_reason: Option<String>,
}

impl RoundState {
    const fn new(round: usize) -> Self {
        Self {
            round,
            started: false,
            text: None,
            thinking: None,
            calls: Vec::new(),
            usage: None,
            stop_reason: None,
        }
    }

    fn apply(&mut self, value: &Value) -> Result<Vec<StreamEvent>> {
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(AgentError::Provider(error.to_string()));
        }

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                model: value.get("model").and_then(Value::as_str).map(ToString::to_string),
            });
        }

        let message = &value["message"];
        if let Some(fragment) = message["thinking"].as_str().filter(|s| !s.is_empty()) {
            let id = format!("r{}-thinking", self.round);
            if self.thinking.is_none() {
                out.push(StreamEvent::ContentBlockStart { id: id.clone(), block: BlockStart::Thinking });
            }
            self.thinking.get_or_insert_with(String::new).push_str(fragment);
            out.push(StreamEvent::ContentBlockDelta {
                id,
                delta: BlockDelta::Thinking(fragment.to_string()),
            });
        }
        if let Some(fragment) = message["content"].as_str().filter(|s| !s.is_empty()) {
            let id = format!("r{}-text", self.round);
            if self.text.is_none() {
                out.push(StreamEvent::ContentBlockStart { id: id.clone(), block: BlockStart::Text });
            }
            self.text.get_or_insert_with(String::new).push_str(fragment);
            out.push(StreamEvent::text_delta(id, fragment));
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let function = &call["function"];
                let name = function["name"].as_str().unwrap_or_default().to_string();
                let input = match &function["arguments"] {
                    Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
                    Value::Null => json!({}),
                    other => other.clone(),
                };
                self.calls.push(PendingToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                    name,
                    input,
                });
            }
        }

        if value["done"].as_bool() == Some(true) {
            self.stop_reason = value["done_reason"].as_str().map(ToString::to_string);
            let input = value["prompt_eval_count"].as_u64();
            let output = value["eval_count"].as_u64();
            if input.is_some() || output.is_some() {
                self.usage = Some(TokenUsage {
                    input_tokens: input.unwrap_or(0),
                    output_tokens: output.unwrap_or(0),
                    ..TokenUsage::default()
                });
            }
        }
        Ok(out)
    }

    fn finish(self) -> FinishedRound {
        let mut blocks = Vec::new();
        if let Some(thinking) = self.thinking {
            blocks.push(ContentBlock::Thinking { thinking, signature: None });
        }
        if let Some(text) = self.text {
            blocks.push(ContentBlock::text(text));
        }
        blocks.extend(self.calls.iter().map(|c| ContentBlock::ToolUse {
            id: c.id.clone(),
            name: c.name.clone(),
            input: c.input.clone(),
        }));
        FinishedRound {
            blocks,
            calls: self.calls,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.base_url(), "http://localhost:11434");
        assert_eq!(config.num_ctx, None);
    }

    #[test]
    fn test_atomic_tool_calls_become_complete_response() {
        let mut state = RoundState::new(0);
        let lines = [
            json!({"model": "qwen3", "message": {"role": "assistant", "content": "Let me look."}, "done": false}),
            json!({"model": "qwen3", "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "files__read", "arguments": {"path": "a.txt"}}},
                {"function": {"name": "files__stat", "arguments": "{\"path\":\"b.txt\"}"}}
            ]}, "done": false}),
            json!({"model": "qwen3", "message": {"role": "assistant", "content": ""}, "done": true,
                   "done_reason": "stop", "prompt_eval_count": 120, "eval_count": 15}),
        ];
        let mut events = Vec::new();
        for line in &lines {
            events.extend(state.apply(line).unwrap());
        }
        assert_eq!(events.len(), 3);

        let finished = state.finish();
        assert_eq!(finished.calls.len(), 2);
        assert_eq!(finished.calls[1].input, json!({"path": "b.txt"}));
        assert_ne!(finished.calls[0].id, finished.calls[1].id);
        assert_eq!(finished.blocks.len(), 3);
        match &finished.blocks[1] {
            ContentBlock::ToolUse { id, .. } => assert_eq!(id, &finished.calls[0].id),
            other => panic!("unexpected block {other:?}"),
        }
        assert_eq!(finished.usage.unwrap().total(), 135);
    }

    #[test]
    fn test_results_follow_in_order() {
        let history = vec![
            Message::user("read both"),
            Message::assistant_blocks(vec![
                ContentBlock::ToolUse { id: "a".into(), name: "files__read".into(), input: json!({}) },
                ContentBlock::ToolUse { id: "b".into(), name: "files__stat".into(), input: json!({}) },
            ]),
            Message::tool_result_for("a", ContentBlock::tool_result("a", "first")),
            Message::tool_result_for("b", ContentBlock::tool_result("b", "second")),
        ];
        let native = to_native(None, &history);

        assert_eq!(native.len(), 4);
        assert_eq!(native[1]["tool_calls"][0]["function"]["name"], "files__read");
        assert_eq!(native[2], json!({"role": "tool", "content": "first"}));
        assert_eq!(native[3]["content"], "second");
    }

    #[test]
    fn test_error_line_fails_round() {
        let mut state = RoundState::new(0);
        let err = state.apply(&json!({"error": "model 'nope' not found"})).unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    mod drive {
        use agent_core::control::CancelFlag;

        use super::*;
        use crate::testing::{
            Canned, CannedBackend, EchoTools, canceller, collect, count, stream_request,
        };

        fn adapter(backend: &CannedBackend) -> OllamaAdapter {
            OllamaAdapter::from_config(OllamaConfig {
                host: "http://127.0.0.1".into(),
                port: backend.port(),
                timeout_secs: 30,
                num_ctx: Some(4096),
            })
            .unwrap()
        }

        fn tool_round() -> Canned {
            Canned::ndjson(&[
                json!({"model": "qwen3", "message": {"role": "assistant", "content": "", "tool_calls": [
                    {"function": {"name": "files__read", "arguments": {"path": "a.txt"}}}
                ]}, "done": false}),
                json!({"model": "qwen3", "message": {"role": "assistant", "content": ""}, "done": true,
                       "done_reason": "stop", "prompt_eval_count": 40, "eval_count": 5}),
            ])
        }

        fn text_round(text: &str) -> Canned {
            Canned::ndjson(&[
                json!({"model": "qwen3", "message": {"role": "assistant", "content": text}, "done": false}),
                json!({"model": "qwen3", "message": {"role": "assistant", "content": ""}, "done": true,
                       "done_reason": "stop"}),
            ])
        }

        #[tokio::test]
        async fn test_tool_round_feeds_result_back() {
            let backend = CannedBackend::start(vec![tool_round(), text_round("a.txt says hi")]).await;
            let adapter = adapter(&backend);
            let tools = Arc::new(EchoTools::new());
            let flag = CancelFlag::new();

            let stream = adapter
                .stream_with_tools(stream_request(vec![Message::user("read a.txt")], 5), tools.clone(), canceller(&flag))
                .await
                .unwrap();
            let (events, error) = collect(stream).await;

            assert!(error.is_none());
            assert_eq!(count(&events, |e| matches!(e, StreamEvent::CompleteResponse { .. })), 2);
            assert_eq!(tools.calls(), vec![("files__read".to_string(), json!({"path": "a.txt"}))]);
            assert!(events.contains(&StreamEvent::text_delta("r1-text", "a.txt says hi")));
            assert_eq!(
                events.last(),
                Some(&StreamEvent::MessageStop { stop_reason: Some("stop".into()) })
            );

            let requests = backend.requests();
            assert_eq!(requests.len(), 2);
            assert_eq!(backend.paths(), vec!["/api/chat", "/api/chat"]);
            assert_eq!(requests[0]["options"]["num_ctx"], 4096);
            assert_eq!(requests[0]["options"]["num_predict"], 256);
            let replayed = requests[1]["messages"].as_array().unwrap();
            assert_eq!(replayed.len(), 3);
            assert_eq!(replayed[1]["tool_calls"][0]["function"]["name"], "files__read");
            assert_eq!(replayed[2], json!({"role": "tool", "content": "files__read ok"}));
        }

        #[tokio::test]
        async fn test_cancelled_before_first_round_sends_nothing() {
            let backend = CannedBackend::start(vec![text_round("unreached")]).await;
            let adapter = adapter(&backend);
            let flag = CancelFlag::new();
            flag.cancel();

            let stream = adapter
                .stream_with_tools(stream_request(vec![Message::user("hi")], 5), Arc::new(EchoTools::new()), canceller(&flag))
                .await
                .unwrap();
            let (events, error) = collect(stream).await;

            assert!(events.is_empty());
            assert!(error.is_none());
            assert!(backend.requests().is_empty());
        }

        #[tokio::test]
        async fn test_cancel_during_tools_stops_the_loop() {
            let backend = CannedBackend::start(vec![tool_round(), text_round("unreached")]).await;
            let adapter = adapter(&backend);
            let flag = CancelFlag::new();
            let tools = Arc::new(EchoTools::cancelling(flag.clone()));

            let stream = adapter
                .stream_with_tools(stream_request(vec![Message::user("read")], 5), tools.clone(), canceller(&flag))
                .await
                .unwrap();
            let (events, _) = collect(stream).await;

            assert_eq!(tools.calls().len(), 1);
            assert_eq!(backend.requests().len(), 1);
            assert!(!events.iter().any(|e| matches!(e, StreamEvent::MaxIterationsReached { .. })));
        }
    }
}
