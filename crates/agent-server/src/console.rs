//! Terminal collaborators: streamed text goes to stdout, everything else to
//! the log.

use std::io::Write;

use agent_core::{ChatLog, Message, Observer, ObserverEvent, TokenUsage, ToolExecutionRecord};

#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn notify(&self, event: &ObserverEvent) {
        let mut out = std::io::stdout().lock();
        // stdout failures are not actionable here
        let _ = match event {
            ObserverEvent::TextDelta { text } => write!(out, "{text}"),
            ObserverEvent::ReasoningDelta { .. } => Ok(()),
            ObserverEvent::ToolStart { name, external } => {
                writeln!(out, "\n[{}tool] {name} ...", if *external { "routed " } else { "" })
            }
            ObserverEvent::ToolComplete {
                name,
                display_text,
                is_error,
                ..
            } => {
                let first_line = display_text.lines().next().unwrap_or_default();
                let status = if *is_error { "failed" } else { "done" };
                writeln!(out, "[tool] {name} {status}: {first_line}")
            }
            ObserverEvent::TokenUsage { usage } => {
                tracing::debug!(input = usage.input_tokens, output = usage.output_tokens, "Token usage");
                Ok(())
            }
            ObserverEvent::Warning { message } => writeln!(out, "\n! {message}"),
            ObserverEvent::Done => writeln!(out),
            ObserverEvent::Error { message } => writeln!(out, "\nerror: {message}"),
        };
        let _ = out.flush();
    }
}

/// Chat log that only traces entries
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingChatLog;

impl ChatLog for TracingChatLog {
    fn user_message_added(&self, message: &Message) {
        tracing::debug!(synthetic = message.is_synthetic(), chars = message.content.len(), "User message");
    }

    fn assistant_message_added(&self, message: &Message) {
        tracing::debug!(
            chars = message.content.len(),
            tool_uses = message.tool_use_ids().len(),
            "Assistant message"
        );
    }

    fn tool_execution_added(&self, record: &ToolExecutionRecord) {
        tracing::debug!(
            tool = %record.name,
            external = record.external,
            from_hook = record.from_hook,
            is_error = record.result.is_error,
            "Tool execution"
        );
    }

    fn token_usage(&self, usage: &TokenUsage) {
        tracing::debug!(total = usage.total(), "Context size");
    }
}
