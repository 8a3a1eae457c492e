//! Provider Adapter Contract
//!
//! Defines the common interface for all model backends (Anthropic, OpenAI,
//! Ollama, ...). An adapter takes canonical messages and tools, runs its own
//! request / tool-execute / re-request loop against the native API and
//! streams canonical [`StreamEvent`]s back.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{ProviderAdapter, StreamRequest};
//!
//! let mut events = adapter.stream_with_tools(request, executor, canceller).await?;
//! while let Some(event) = events.next().await {
//!     // ...
//! }
//! ```

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::control::Canceller;
use crate::error::{AgentError, Result};
use crate::event::StreamEvent;
use crate::message::{Message, ToolResultPairing};
use crate::tool::{ToolExecutionResult, ToolExecutor, ToolSpec};

/// Bound used for "unlimited" iterations
pub const UNLIMITED_ITERATIONS: usize = 1_000_000;

/// Context window assumed when a model is unknown
pub const DEFAULT_CONTEXT_WINDOW: u64 = 128_000;

/// Stream type for canonical adapter output
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Maximum backend round-trips per turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Iterations {
    Limited(usize),
    Unlimited,
}

impl Iterations {
    pub const fn bound(self) -> usize {
        match self {
            Self::Limited(n) => n,
            Self::Unlimited => UNLIMITED_ITERATIONS,
        }
    }
}

impl Default for Iterations {
    fn default() -> Self {
        Self::Limited(25)
    }
}

/// One streamed, tool-enabled turn
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub system: Option<String>,
    pub tools: Vec<ToolSpec>,
    pub max_output_tokens: u32,
    pub max_iterations: usize,
}

/// One non-streaming, tool-less request (summaries)
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub system: Option<String>,
    pub max_output_tokens: u32,
}

/// Strategy trait for model backends
///
/// Implement this trait to add support for a new backend. The orchestrator
/// works exclusively through this interface.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Backend family name, for logs
    fn name(&self) -> &str;

    /// How this backend pairs tool results with their invocations
    fn pairing(&self) -> ToolResultPairing;

    /// Context window of `model` in tokens
    fn context_window(&self, model: &str) -> u64 {
        let _ = model;
        DEFAULT_CONTEXT_WINDOW
    }

    /// Run a full tool-use turn, streaming canonical events.
    ///
    /// `canceller` is checked before every backend round-trip and before
    /// every individual tool call.
    async fn stream_with_tools(
        &self,
        request: StreamRequest,
        executor: Arc<dyn ToolExecutor>,
        canceller: Arc<dyn Canceller>,
    ) -> Result<EventStream>;

    /// Non-streaming completion returning the concatenated text
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Exact post-hoc token count, when the backend can provide one
    async fn count_tokens(&self, request: &StreamRequest) -> Result<Option<u64>> {
        let _ = request;
        Ok(None)
    }
}

/// Sending half of an [`EventStream`], used by adapter loops.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<Result<StreamEvent>>,
}

impl EventSink {
    /// Create a sink and the stream it feeds
    pub fn channel(buffer: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, Box::pin(ReceiverStream::new(rx)))
    }

    /// Emit one event; false once the consumer has gone away
    pub async fn emit(&self, event: StreamEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    /// Terminate the stream with an error
    pub async fn fail(&self, error: AgentError) {
        if self.tx.send(Err(error)).await.is_err() {
            tracing::debug!("Event consumer dropped before error delivery");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A tool invocation requested by the backend in one round-trip
#[derive(Clone, Debug, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl PendingToolCall {
    /// Parse accumulated argument JSON; empty or invalid input becomes `{}`.
    pub fn from_fragments(id: String, name: String, json: &str) -> Self {
        let input = if json.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(json).unwrap_or_else(|e| {
                tracing::warn!(tool = %name, error = %e, "Tool arguments are not valid JSON");
                serde_json::json!({})
            })
        };
        Self { id, name, input }
    }
}

/// Execute the calls of one round in order, emitting `tool_use_complete`
/// for each. Cancellation is re-checked before every call; calls that had
/// not started get a synthetic cancelled result instead of running.
///
/// Returns `None` when the consumer went away.
pub async fn execute_tool_calls(
    calls: &[PendingToolCall],
    executor: &dyn ToolExecutor,
    canceller: &dyn Canceller,
    sink: &EventSink,
) -> Option<Vec<ToolExecutionResult>> {
    let mut results = Vec::with_capacity(calls.len());

    for call in calls {
        let result = if canceller.is_cancelled() {
            tracing::debug!(tool = %call.name, "Skipping tool call after cancellation");
            ToolExecutionResult::cancelled(None)
        } else {
            executor.execute(&call.name, call.input.clone()).await
        };

        let delivered = sink
            .emit(StreamEvent::ToolUseComplete {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
                result: result.clone(),
            })
            .await;
        if !delivered {
            return None;
        }
        results.push(result);
    }

    Some(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CancelFlag;
    use crate::testing::RecordingExecutor;
    use futures::StreamExt;

    #[test]
    fn test_unlimited_is_a_large_bound() {
        assert_eq!(Iterations::Limited(3).bound(), 3);
        assert!(Iterations::Unlimited.bound() >= 1_000_000);
    }

    #[test]
    fn test_invalid_fragments_become_empty_object() {
        let call = PendingToolCall::from_fragments("t1".into(), "a__b".into(), "{\"q\":");
        assert_eq!(call.input, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_cancelled_calls_never_execute() {
        let executor = RecordingExecutor::new();
        let flag = CancelFlag::new();
        let (sink, mut events) = EventSink::channel(16);
        let calls = vec![
            PendingToolCall { id: "1".into(), name: "alpha__search".into(), input: serde_json::json!({}) },
            PendingToolCall { id: "2".into(), name: "alpha__search".into(), input: serde_json::json!({}) },
        ];

        flag.cancel();
        let results = execute_tool_calls(&calls, &executor, &flag, &sink).await.unwrap();
        drop(sink);

        assert!(results.iter().all(|r| r.cancelled));
        assert!(executor.calls().is_empty());
        let mut completions = 0;
        while let Some(Ok(StreamEvent::ToolUseComplete { .. })) = events.next().await {
            completions += 1;
        }
        assert_eq!(completions, 2);
    }
}
