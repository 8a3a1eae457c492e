//! HTTP plumbing shared by the backend adapters: client construction, error
//! mapping, server-sent events and newline-delimited JSON.

use std::pin::Pin;
use std::time::Duration;

use agent_core::error::{AgentError, Result, describe_backend_failure};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Response;

/// Longest silence tolerated inside a streaming response
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Map a transport failure (no HTTP status) to an error
pub fn transport_error(err: &reqwest::Error) -> AgentError {
    if err.is_connect() {
        AgentError::ProviderUnavailable(format!("cannot reach backend: {err}"))
    } else if err.is_timeout() {
        AgentError::ProviderUnavailable("backend request timed out".into())
    } else {
        AgentError::Provider(err.to_string())
    }
}

/// Failed exchange: status plus body text
#[derive(Debug)]
pub struct HttpFailure {
    pub status: u16,
    pub body: String,
}

impl HttpFailure {
    pub fn into_error(self) -> AgentError {
        describe_backend_failure(Some(self.status), &self.body)
    }
}

/// Split a response into success or a failure carrying the body, so callers
/// can pattern-match rejections before rewriting them.
pub async fn split_status(response: Response) -> std::result::Result<Response, HttpFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HttpFailure {
        status: status.as_u16(),
        body,
    })
}

type DataStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Reads the `data` payloads of a server-sent event stream
pub struct SseReader {
    inner: DataStream,
}

impl SseReader {
    pub fn new(response: Response) -> Self {
        let inner = response
            .bytes_stream()
            .eventsource()
            .map(|event| {
                event
                    .map(|e| e.data)
                    .map_err(|e| AgentError::Provider(format!("SSE error: {e}")))
            });
        Self {
            inner: Box::pin(inner),
        }
    }

    /// Next non-empty payload; `None` at end of stream
    pub async fn next_data(&mut self) -> Result<Option<String>> {
        loop {
            let next = tokio::time::timeout(IDLE_TIMEOUT, self.inner.next())
                .await
                .map_err(|_| AgentError::ProviderUnavailable("stream idle timeout".into()))?;
            match next {
                Some(Ok(data)) if data.trim().is_empty() => {}
                Some(Ok(data)) => return Ok(Some(data)),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

/// Splits a byte stream into lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    /// Feed bytes, returning every completed non-blank line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Remaining unterminated line, if any
    pub fn finish(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&std::mem::take(&mut self.buffer))
            .trim()
            .to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Reads newline-delimited JSON objects
pub struct NdjsonReader {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
    lines: LineBuffer,
    ready: std::collections::VecDeque<String>,
    done: bool,
}

impl NdjsonReader {
    pub fn new(response: Response) -> Self {
        Self {
            bytes: Box::pin(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()))),
            lines: LineBuffer::default(),
            ready: std::collections::VecDeque::new(),
            done: false,
        }
    }

    pub async fn next_value(&mut self) -> Result<Option<serde_json::Value>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(serde_json::from_str(&line)?));
            }
            if self.done {
                return Ok(None);
            }
            let next = tokio::time::timeout(IDLE_TIMEOUT, self.bytes.next())
                .await
                .map_err(|_| AgentError::ProviderUnavailable("stream idle timeout".into()))?;
            match next {
                Some(Ok(chunk)) => self.ready.extend(self.lines.push(&chunk)),
                Some(Err(e)) => return Err(transport_error(&e)),
                None => {
                    self.done = true;
                    self.ready.extend(self.lines.finish());
                }
            }
        }
    }
}
