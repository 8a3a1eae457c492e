//! # agent-runtime
//!
//! Concrete model backends behind the [`ProviderAdapter`] contract.
//!
//! ## Providers
//!
//! - **Anthropic**: Messages API over server-sent events
//! - **OpenAI**: any OpenAI-compatible `/chat/completions` endpoint
//! - **Ollama** (default feature): local inference, newline-delimited JSON
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{ProviderConfig, ProviderKind, build_adapter};
//!
//! let kind = ProviderKind::from_env()?;
//! let adapter = build_adapter(ProviderConfig::from_env(kind)?)?;
//! let mut orchestrator = Orchestrator::builder()
//!     .adapter(adapter)
//!     .executor(dispatcher)
//!     .model(kind.default_model())
//!     .build()?;
//! ```

pub mod anthropic;
pub mod factory;
pub mod http;
#[cfg(feature = "ollama")]
pub mod ollama;
pub mod openai;

#[cfg(test)]
pub(crate) mod testing;

pub use anthropic::{AnthropicAdapter, AnthropicConfig};
pub use factory::{PROVIDER_ENV, ProviderConfig, ProviderKind, build_adapter};
#[cfg(feature = "ollama")]
pub use ollama::{OllamaAdapter, OllamaConfig};
pub use openai::{OpenAiAdapter, OpenAiConfig};

// Re-export core types for convenience
pub use agent_core::{AgentError, ProviderAdapter, Result};
