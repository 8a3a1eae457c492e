//! Adapter selection from the environment.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use agent_core::{
    error::{AgentError, Result},
    provider::ProviderAdapter,
};

use crate::anthropic::{AnthropicAdapter, AnthropicConfig};
#[cfg(feature = "ollama")]
use crate::ollama::{OllamaAdapter, OllamaConfig};
use crate::openai::{OpenAiAdapter, OpenAiConfig};

/// Environment variable naming the backend family
pub const PROVIDER_ENV: &str = "AGENT_PROVIDER";

/// Backend family
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderKind {
    #[default]
    Anthropic,
    OpenAi,
    Ollama,
}

impl ProviderKind {
    /// Read `AGENT_PROVIDER`, defaulting to Anthropic when unset
    pub fn from_env() -> Result<Self> {
        std::env::var(PROVIDER_ENV).map_or_else(|_| Ok(Self::default()), |v| v.parse())
    }

    /// Model used when none is configured
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
            Self::Ollama => "qwen3",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "openai-compatible" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(AgentError::Config(format!("Unknown provider: {other}"))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

/// Resolved configuration for one backend family
#[derive(Clone, Debug)]
pub enum ProviderConfig {
    Anthropic(AnthropicConfig),
    OpenAi(OpenAiConfig),
    #[cfg(feature = "ollama")]
    Ollama(OllamaConfig),
}

impl ProviderConfig {
    pub fn from_env(kind: ProviderKind) -> Result<Self> {
        match kind {
            ProviderKind::Anthropic => Ok(Self::Anthropic(AnthropicConfig::from_env()?)),
            ProviderKind::OpenAi => Ok(Self::OpenAi(OpenAiConfig::from_env()?)),
            #[cfg(feature = "ollama")]
            ProviderKind::Ollama => Ok(Self::Ollama(OllamaConfig::from_env())),
            #[cfg(not(feature = "ollama"))]
            ProviderKind::Ollama => Err(AgentError::Config(
                "Ollama support is not compiled in (enable the `ollama` feature)".into(),
            )),
        }
    }

    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Anthropic(_) => ProviderKind::Anthropic,
            Self::OpenAi(_) => ProviderKind::OpenAi,
            #[cfg(feature = "ollama")]
            Self::Ollama(_) => ProviderKind::Ollama,
        }
    }
}

/// Build the adapter for a resolved configuration
pub fn build_adapter(config: ProviderConfig) -> Result<Arc<dyn ProviderAdapter>> {
    tracing::info!(provider = %config.kind(), "Building provider adapter");
    Ok(match config {
        ProviderConfig::Anthropic(c) => Arc::new(AnthropicAdapter::new(c)?),
        ProviderConfig::OpenAi(c) => Arc::new(OpenAiAdapter::new(c)?),
        #[cfg(feature = "ollama")]
        ProviderConfig::Ollama(c) => Arc::new(OllamaAdapter::from_config(c)?),
    })
}
