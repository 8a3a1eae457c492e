//! # agent-core
//!
//! Backend-agnostic conversation loop for an agent that calls tools on many
//! external tool-servers through one of several interchangeable model
//! backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 TaskEnforcementController (optional)             │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                      Orchestrator                          │  │
//! │  │  ┌──────────────┐  ┌─────────────────┐  ┌───────────────┐  │  │
//! │  │  │ Conversation │  │ ContextManager  │  │ ProviderAdapter│ │  │
//! │  │  │  (messages)  │  │ (summarization) │──│  (Strategy)    │ │  │
//! │  │  └──────────────┘  └─────────────────┘  └───────┬───────┘  │  │
//! │  └─────────────────────────────────────────────────┼──────────┘  │
//! │                                     ToolExecutor ◄─┘             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ProviderAdapter` trait lets the orchestrator drive Anthropic, OpenAI,
//! Ollama or any other backend through one canonical [`StreamEvent`]
//! vocabulary; the `ToolExecutor` trait is the seam to the tool-server
//! dispatcher.

pub mod admission;
pub mod context;
pub mod control;
pub mod error;
pub mod event;
pub mod message;
pub mod observer;
pub mod orchestrator;
pub mod provider;
pub mod tasks;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{BusyFlag, BusyGuard};
pub use context::{ContextManager, ContextSettings};
pub use control::{ApprovalDecision, Approver, CancelFlag, Canceller, Controls, ForceStopper};
pub use error::{AgentError, Result};
pub use event::{BlockDelta, BlockStart, StreamEvent, TokenUsage};
pub use message::{ContentBlock, Conversation, Message, Role, ToolResultPairing};
pub use observer::{ChatLog, Collaborators, Observer, ObserverEvent, ToolExecutionRecord};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig, TurnOutcome, TurnStop};
pub use provider::{Iterations, ProviderAdapter, StreamRequest};
pub use tasks::{MemoryTaskStore, TaskEnforcementController, TaskStore, TaskTools};
pub use tool::{ToolExecutionResult, ToolExecutor, ToolSpec};
