//! Plain-text transcript rendering

use std::collections::HashMap;

use chrono::{Local, TimeZone};
use vektra_chat::{AwaitingConfirmation, ConfirmationPolicy, ConversationState, StreamStatus};
use vektra_protocol::{Message, Part, Role, ToolCallPart, ToolCallState};

const PREVIEW_CHARS: usize = 200;

/// Prints each message once, and again whenever its rendering changes
#[derive(Default)]
pub struct Transcript {
    printed: HashMap<String, String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render messages that are new or changed since the last call
    pub fn flush(
        &mut self,
        state: &ConversationState,
        policy: &ConfirmationPolicy,
        debug: bool,
    ) -> Vec<String> {
        let mut out = vec![];
        for message in &state.messages {
            let mut block = render_message(message, policy);
            if debug {
                block.push('\n');
                block.push_str(&render_debug(message));
            }
            if self.printed.get(&message.id) != Some(&block) {
                self.printed.insert(message.id.clone(), block.clone());
                out.push(block);
            }
        }
        out
    }

    /// Forget what was printed, after the history is cleared
    pub fn reset(&mut self) {
        self.printed.clear();
    }
}

/// Format a Unix-millisecond timestamp as local HH:MM
pub fn format_time(created_at: i64) -> String {
    match Local.timestamp_millis_opt(created_at).single() {
        Some(time) => time.format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

/// Render a message with its parts
pub fn render_message(message: &Message, policy: &ConfirmationPolicy) -> String {
    let who = match message.role {
        Role::User => "you",
        Role::Assistant => "agent",
    };
    let mut lines = vec![format!("{} [{}]", who, format_time(message.created_at))];

    for part in &message.parts {
        match part {
            Part::Text { text } if text.is_empty() => {}
            Part::Text { .. } => {
                let body = part.scheduled_body().unwrap_or_default();
                if part.is_scheduled() {
                    lines.push(format!("  [scheduled] {}", body));
                } else {
                    lines.extend(body.lines().map(|l| format!("  {}", l)));
                }
            }
            Part::ToolCall(call) if message.is_assistant() => {
                lines.push(render_tool_call(
                    call,
                    policy.requires_confirmation(&call.tool_name),
                ));
            }
            Part::ToolCall(_) => {}
        }
    }
    lines.join("\n")
}

/// One-line summary of a tool call
pub fn render_tool_call(call: &ToolCallPart, gated: bool) -> String {
    let mut line = format!("  [{} {}: {}]", call.tool_name, call.call_id, call.state);
    if !call.input.is_null() {
        line.push_str(&format!(" {}", preview(&call.input.to_string())));
    }
    match call.state {
        ToolCallState::InputAvailable if gated => line.push_str(" (awaiting confirmation)"),
        ToolCallState::OutputAvailable => {
            if let Some(ref output) = call.output {
                line.push_str(&format!("\n    -> {}", preview(&output_text(output))));
            }
        }
        ToolCallState::OutputError => {
            let reason = call.error_text.as_deref().unwrap_or("failed");
            line.push_str(&format!("\n    !! {}", reason));
        }
        _ => {}
    }
    line
}

/// Prompt shown for a gated call
pub fn render_confirmation(waiting: &AwaitingConfirmation) -> String {
    format!(
        "Run {} with {}? /approve {} or /deny {}",
        waiting.tool_name,
        preview(&waiting.input.to_string()),
        waiting.call_id,
        waiting.call_id
    )
}

/// Status line printed when a turn ends or fails
pub fn render_status(state: &ConversationState) -> Option<String> {
    match state.stream_status {
        StreamStatus::Error => Some(format!(
            "[error: {}]",
            state.error.as_deref().unwrap_or("stream failed")
        )),
        _ => None,
    }
}

fn render_debug(message: &Message) -> String {
    serde_json::to_string_pretty(message).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}

fn output_text(output: &serde_json::Value) -> String {
    match output.as_str() {
        Some(s) => s.to_string(),
        None => output.to_string(),
    }
}

/// Truncate to `PREVIEW_CHARS` characters on char boundaries
fn preview(s: &str) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
