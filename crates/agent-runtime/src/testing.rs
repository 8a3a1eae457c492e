//! Local canned backend and helpers for adapter tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agent_core::{
    control::{CancelFlag, Canceller},
    error::AgentError,
    event::StreamEvent,
    message::Message,
    provider::{EventStream, StreamRequest},
    tool::{ToolExecutionResult, ToolExecutor, ToolSpec},
};
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::{Value, json};

/// One scripted HTTP reply
#[derive(Clone, Debug)]
pub struct Canned {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Canned {
    /// Server-sent events, one `data:` line per payload
    pub fn sse(payloads: &[Value]) -> Self {
        let body = payloads.iter().map(|p| format!("data: {p}\n\n")).collect();
        Self {
            status: 200,
            content_type: "text/event-stream",
            body,
        }
    }

    /// Like [`sse`](Self::sse), terminated by `data: [DONE]`
    pub fn sse_done(payloads: &[Value]) -> Self {
        let mut canned = Self::sse(payloads);
        canned.body.push_str("data: [DONE]\n\n");
        canned
    }

    pub fn ndjson(lines: &[Value]) -> Self {
        let body = lines.iter().map(|l| format!("{l}\n")).collect();
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            body,
        }
    }

    pub fn error(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }
}

#[derive(Default)]
struct Script {
    replies: Mutex<VecDeque<Canned>>,
    requests: Mutex<Vec<(String, Value)>>,
}

/// HTTP server on a loopback port replaying [`Canned`] replies in order and
/// recording every request body.
pub struct CannedBackend {
    url: String,
    script: Arc<Script>,
}

impl CannedBackend {
    pub async fn start(replies: Vec<Canned>) -> Self {
        let script = Arc::new(Script {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new().fallback(reply).with_state(Arc::clone(&script));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            script,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.url.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap()
    }

    /// Request bodies received so far
    pub fn requests(&self) -> Vec<Value> {
        self.script.requests.lock().unwrap().iter().map(|(_, body)| body.clone()).collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.script.requests.lock().unwrap().iter().map(|(path, _)| path.clone()).collect()
    }
}

async fn reply(State(script): State<Arc<Script>>, uri: Uri, body: Bytes) -> Response {
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    script.requests.lock().unwrap().push((uri.path().to_string(), json));

    let Some(canned) = script.replies.lock().unwrap().pop_front() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "script exhausted").into_response();
    };
    Response::builder()
        .status(canned.status)
        .header(CONTENT_TYPE, canned.content_type)
        .body(Body::from(canned.body))
        .unwrap()
}

/// Executor answering `"<name> ok"`, optionally requesting cancellation
/// from inside the call
#[derive(Default)]
pub struct EchoTools {
    calls: Mutex<Vec<(String, Value)>>,
    cancel_on_call: Option<CancelFlag>,
}

impl EchoTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling(flag: CancelFlag) -> Self {
        Self {
            cancel_on_call: Some(flag),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for EchoTools {
    async fn available_tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn execute(&self, name: &str, input: Value) -> ToolExecutionResult {
        self.calls.lock().unwrap().push((name.to_string(), input));
        if let Some(flag) = &self.cancel_on_call {
            flag.cancel();
        }
        ToolExecutionResult::text(format!("{name} ok"))
    }
}

pub fn stream_request(messages: Vec<Message>, max_iterations: usize) -> StreamRequest {
    StreamRequest {
        messages,
        model: "test-model".into(),
        system: None,
        tools: vec![ToolSpec::new("files", "read", "Read a file", json!({"type": "object"}))],
        max_output_tokens: 256,
        max_iterations,
    }
}

pub fn canceller(flag: &CancelFlag) -> Arc<dyn Canceller> {
    Arc::new(flag.clone())
}

/// Drain a stream into its events and the error that ended it, if any
pub async fn collect(mut stream: EventStream) -> (Vec<StreamEvent>, Option<AgentError>) {
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(e) => return (events, Some(e)),
        }
    }
    (events, None)
}

pub fn count(events: &[StreamEvent], pred: impl Fn(&StreamEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
