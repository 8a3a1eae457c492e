//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The model rejected a request feature it does not support (e.g. reasoning)
    #[error("Capability rejected: {0}")]
    CapabilityRejected(String),

    /// A query is already in flight on this orchestrator
    #[error("Already processing a query")]
    Busy,

    /// The operation was cancelled by the user
    #[error("Cancelled")]
    Cancelled,

    /// Tool not found in any connected server
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Maximum iterations reached in the tool-use loop
    #[error("Maximum iterations ({0}) reached")]
    MaxIterations(usize),

    /// Context length exceeded
    #[error("Context length exceeded: {used} tokens (max: {max})")]
    ContextOverflow { used: u64, max: u64 },

    /// Summarization request failed
    #[error("Summarization failed: {0}")]
    Summarization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::RateLimited(_) | Self::Io(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(msg) => format!("The AI service is currently unavailable: {msg}"),
            Self::CapabilityRejected(msg) => format!("The model rejected the request: {msg}"),
            Self::Busy => "A request is already being processed. Wait for it to finish.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::MaxIterations(n) => format!("Stopped after {n} tool-use rounds."),
            Self::ContextOverflow { .. } => {
                "The conversation is too long for this model. Clear or summarize it.".into()
            }
            Self::RateLimited(_) => "Too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your API key.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Turn a failed backend HTTP exchange into a short, actionable error.
///
/// Proxy error pages and bare status codes are rewritten instead of being
/// dumped raw; JSON error envelopes are reduced to their message.
pub fn describe_backend_failure(status: Option<u16>, body: &str) -> AgentError {
    let trimmed = body.trim();
    let lower = trimmed.to_ascii_lowercase();
    let html = lower.starts_with("<!doctype")
        || lower.starts_with("<html")
        || lower.contains("</html>")
        || lower.contains("<body");
    let status = status.or_else(|| bare_status(trimmed));

    match status {
        Some(401 | 403) => AgentError::Auth(format!(
            "HTTP {}: check the API key for this backend",
            status.unwrap_or_default()
        )),
        Some(429) => AgentError::RateLimited(
            extract_error_message(trimmed)
                .unwrap_or_else(|| "HTTP 429: slow down and retry shortly".into()),
        ),
        Some(code @ (502..=504)) if html || trimmed.is_empty() || bare_status(trimmed).is_some() => {
            AgentError::ProviderUnavailable(format!(
                "upstream gateway returned HTTP {code}; the backend may be overloaded or unreachable"
            ))
        }
        _ if html => AgentError::Provider(format!(
            "received an HTML error page{} instead of an API response; check the endpoint URL and any proxy in between",
            status.map(|c| format!(" (HTTP {c})")).unwrap_or_default()
        )),
        Some(code) if trimmed.is_empty() || bare_status(trimmed).is_some() => {
            AgentError::Provider(format!("backend returned HTTP {code} without details"))
        }
        Some(code) => AgentError::Provider(format!(
            "HTTP {code}: {}",
            extract_error_message(trimmed).unwrap_or_else(|| truncate(trimmed, 300))
        )),
        None => AgentError::Provider(
            extract_error_message(trimmed).unwrap_or_else(|| truncate(trimmed, 300)),
        ),
    }
}

fn bare_status(body: &str) -> Option<u16> {
    if body.len() == 3 && body.chars().all(|c| c.is_ascii_digit()) {
        body.parse().ok()
    } else {
        None
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(ToString::to_string)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}
