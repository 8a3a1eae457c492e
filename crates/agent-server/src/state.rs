//! Application State

use std::sync::Arc;

use agent_core::{BusyFlag, ChatLog, Observer};
use agent_mcp::ToolDispatcher;

/// Shared listener state
#[derive(Clone)]
pub struct AppState {
    /// Executes routed tool calls
    pub dispatcher: Arc<ToolDispatcher>,

    /// Admission control shared with the conversation driver
    pub busy: BusyFlag,

    /// Live display of routed calls
    pub observer: Arc<dyn Observer>,

    /// Records routed calls as external executions
    pub chat_log: Arc<dyn ChatLog>,
}
