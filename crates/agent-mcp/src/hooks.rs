//! Tool Hooks
//!
//! Pre/post hooks run around tool calls whose name matches their pattern:
//! an exact namespaced name, `server__*`, or `*`.

use std::sync::Arc;

use agent_core::tool::{NAMESPACE_SEPARATOR, ToolExecutionResult, split_namespaced};
use async_trait::async_trait;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolMatcher {
    Exact(String),
    Server(String),
    Any,
}

impl ToolMatcher {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            return Self::Any;
        }
        match pattern.strip_suffix('*').and_then(|p| p.strip_suffix(NAMESPACE_SEPARATOR)) {
            Some(server) if !server.is_empty() => Self::Server(server.to_string()),
            _ => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, tool: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(name) => name == tool,
            Self::Server(server) => split_namespaced(tool).is_some_and(|(s, _)| s == server),
        }
    }
}

/// Lets a hook call other tools
#[async_trait]
pub trait HookToolInvoker: Send + Sync {
    async fn invoke_from_hook(&self, tool: &str, input: Value) -> ToolExecutionResult;
}

pub struct HookContext<'a> {
    pub tool: &'a str,
    pub input: &'a Value,
    pub invoker: &'a dyn HookToolInvoker,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreHookOutcome {
    /// Run the tool; `inject` is appended to its result
    Continue { inject: Option<String> },
    /// Skip the tool; the reason becomes the (failed) result
    Block(String),
}

impl PreHookOutcome {
    pub const fn proceed() -> Self {
        Self::Continue { inject: None }
    }
}

#[async_trait]
pub trait ToolHook: Send + Sync {
    async fn before(&self, _ctx: &HookContext<'_>) -> PreHookOutcome {
        PreHookOutcome::proceed()
    }

    /// Text returned here is appended to the result.
    async fn after(&self, _ctx: &HookContext<'_>, _result: &ToolExecutionResult) -> Option<String> {
        None
    }
}

#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<(ToolMatcher, Arc<dyn ToolHook>)>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_hook(mut self, pattern: &str, hook: Arc<dyn ToolHook>) -> Self {
        self.hooks.push((ToolMatcher::parse(pattern), hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn matching<'a>(&'a self, tool: &'a str) -> impl Iterator<Item = &'a Arc<dyn ToolHook>> + 'a {
        self.hooks
            .iter()
            .filter(move |(matcher, _)| matcher.matches(tool))
            .map(|(_, hook)| hook)
    }

    /// Run matching pre-hooks in registration order. The first block wins;
    /// injections accumulate.
    pub async fn run_before(&self, ctx: &HookContext<'_>) -> PreHookOutcome {
        let mut injected: Vec<String> = Vec::new();
        for hook in self.matching(ctx.tool) {
            match hook.before(ctx).await {
                PreHookOutcome::Block(reason) => return PreHookOutcome::Block(reason),
                PreHookOutcome::Continue { inject } => injected.extend(inject),
            }
        }
        PreHookOutcome::Continue {
            inject: (!injected.is_empty()).then(|| injected.join("\n")),
        }
    }

    pub async fn run_after(&self, ctx: &HookContext<'_>, result: &ToolExecutionResult) -> Vec<String> {
        let mut notes = Vec::new();
        for hook in self.matching(ctx.tool) {
            notes.extend(hook.after(ctx, result).await);
        }
        notes
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(matcher, _)| matcher))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_patterns() {
        assert_eq!(ToolMatcher::parse("*"), ToolMatcher::Any);
        assert_eq!(ToolMatcher::parse("files__*"), ToolMatcher::Server("files".into()));
        assert_eq!(ToolMatcher::parse("files__read"), ToolMatcher::Exact("files__read".into()));

        let server = ToolMatcher::parse("files__*");
        assert!(server.matches("files__read"));
        assert!(!server.matches("filesystem__read"));
        assert!(!ToolMatcher::parse("files__read").matches("files__write"));
    }
}
