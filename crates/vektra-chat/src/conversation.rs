//! Conversation state: messages, stream status, and the confirmation gate.

use serde::{Deserialize, Serialize};
use std::fmt;
use vektra_protocol::{Message, ToolCallPart, ToolCallState};

use crate::policy::ConfirmationPolicy;

/// Lifecycle phase of the current turn's exchange with the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Idle,
    /// Request sent, nothing received yet
    Submitted,
    Streaming,
    /// The last stream failed; partial messages are kept
    Error,
}

impl StreamStatus {
    /// Whether a stream is in flight
    pub fn is_active(self) -> bool {
        matches!(self, StreamStatus::Submitted | StreamStatus::Streaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Idle => "idle",
            StreamStatus::Submitted => "submitted",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Error => "error",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a conversation handed to consumers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Conversation messages, in arrival order
    pub messages: Vec<Message>,
    pub stream_status: StreamStatus,
    /// A gated tool call is waiting for a human decision
    pub pending_confirmation: bool,
    /// Reason for the last stream failure, set while `stream_status` is `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConversationState {
    /// Find a message by id
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Find a tool call anywhere in the conversation
    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallPart> {
        self.messages.iter().find_map(|m| m.tool_call(call_id))
    }

    /// The composer accepts input unless a confirmation is pending
    pub fn input_enabled(&self) -> bool {
        !self.pending_confirmation
    }

    /// Whether the stop control applies (a stream is in flight)
    pub fn can_stop(&self) -> bool {
        self.stream_status.is_active()
    }

    /// Placeholder text for the composer
    pub fn composer_placeholder(&self) -> &'static str {
        if self.pending_confirmation {
            "Waiting for tool confirmation..."
        } else {
            "Type your message..."
        }
    }
}

/// A gated tool call that is waiting for a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingConfirmation {
    pub message_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

fn gated_calls<'a>(
    messages: &'a [Message],
    policy: &'a ConfirmationPolicy,
) -> impl Iterator<Item = (&'a Message, &'a ToolCallPart)> + 'a {
    messages
        .iter()
        .filter(|m| m.is_assistant())
        .flat_map(|m| m.tool_calls().map(move |call| (m, call)))
        .filter(|(_, call)| {
            call.state == ToolCallState::InputAvailable
                && policy.requires_confirmation(&call.tool_name)
        })
}

/// True iff an assistant message holds a gated tool call in `InputAvailable`
pub fn pending_confirmation(messages: &[Message], policy: &ConfirmationPolicy) -> bool {
    gated_calls(messages, policy).next().is_some()
}

/// Every gated tool call currently waiting, in conversation order
pub fn awaiting_confirmation(
    messages: &[Message],
    policy: &ConfirmationPolicy,
) -> Vec<AwaitingConfirmation> {
    gated_calls(messages, policy)
        .map(|(m, call)| AwaitingConfirmation {
            message_id: m.id.clone(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            input: call.input.clone(),
        })
        .collect()
}
