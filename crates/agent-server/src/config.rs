//! Server configuration, read from the environment after `.env` is loaded.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agent_core::{ContextSettings, Iterations};
use agent_runtime::ProviderKind;
use anyhow::Context;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// `mcpServers` document
    pub mcp_config: PathBuf,

    /// Persisted tool enable/disable state
    pub tool_state: PathBuf,

    /// Bind address of the sub-agent tool listener
    pub listen_addr: SocketAddr,

    pub provider: ProviderKind,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_output_tokens: u32,
    pub iterations: Iterations,
    pub tool_timeout: Duration,
    pub context: ContextSettings,

    /// Kill hung tool-servers when a query is cancelled
    pub force_stop: bool,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let provider = ProviderKind::from_env()?;
        let listen_addr = var_or("AGENT_LISTEN_ADDR", "127.0.0.1:7878")
            .parse()
            .context("AGENT_LISTEN_ADDR is not a socket address")?;

        let mut context = ContextSettings::default();
        if let Some(enabled) = parse_var::<bool>("AGENT_CONTEXT_SUMMARIZE")? {
            context.enabled = enabled;
        }
        if let Some(percent) = parse_var::<u8>("AGENT_CONTEXT_THRESHOLD")? {
            anyhow::ensure!((1..=100).contains(&percent), "AGENT_CONTEXT_THRESHOLD must be 1-100");
            context.threshold_percent = percent;
        }
        if let Some(keep) = parse_var::<usize>("AGENT_CONTEXT_KEEP_RECENT")? {
            context.keep_recent = keep;
        }

        Ok(Self {
            mcp_config: var_or("AGENT_MCP_CONFIG", "mcp_servers.json").into(),
            tool_state: var_or("AGENT_TOOL_STATE", ".agent/tool_state.json").into(),
            listen_addr,
            provider,
            model: std::env::var("AGENT_MODEL").unwrap_or_else(|_| provider.default_model().to_string()),
            system_prompt: std::env::var("AGENT_SYSTEM_PROMPT").ok().filter(|s| !s.trim().is_empty()),
            max_output_tokens: parse_var("AGENT_MAX_OUTPUT_TOKENS")?.unwrap_or(8_192),
            iterations: parse_iterations(std::env::var("AGENT_MAX_ITERATIONS").ok().as_deref())?,
            tool_timeout: Duration::from_secs(parse_var("AGENT_TOOL_TIMEOUT_SECS")?.unwrap_or(120)),
            context,
            force_stop: parse_var("AGENT_FORCE_STOP")?.unwrap_or(false),
        })
    }

    /// URL handed to spawned tool-servers
    pub fn router_url(&self) -> String {
        format!("http://{}", self.listen_addr)
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .ok()
        .map(|v| v.trim().parse::<T>().with_context(|| format!("{key} has an invalid value: {v}")))
        .transpose()
}

/// `unlimited` or a positive count; unset keeps the default
fn parse_iterations(value: Option<&str>) -> anyhow::Result<Iterations> {
    match value.map(str::trim) {
        None | Some("") => Ok(Iterations::default()),
        Some(v) if v.eq_ignore_ascii_case("unlimited") => Ok(Iterations::Unlimited),
        Some(v) => {
            let n: usize = v.parse().with_context(|| format!("AGENT_MAX_ITERATIONS has an invalid value: {v}"))?;
            anyhow::ensure!(n > 0, "AGENT_MAX_ITERATIONS must be positive");
            Ok(Iterations::Limited(n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterations_parsing() {
        assert_eq!(parse_iterations(None).unwrap(), Iterations::default());
        assert_eq!(parse_iterations(Some("Unlimited")).unwrap(), Iterations::Unlimited);
        assert_eq!(parse_iterations(Some(" 7 ")).unwrap(), Iterations::Limited(7));
        assert!(parse_iterations(Some("0")).is_err());
        assert!(parse_iterations(Some("many")).is_err());
    }
}
