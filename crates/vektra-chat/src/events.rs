//! Notifications sent from the reconciler to a presentation layer

use serde::{Deserialize, Serialize};
use vektra_protocol::ToolCallState;

use crate::conversation::StreamStatus;

/// Events emitted as the conversation changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Stream status moved
    StatusChanged {
        from: StreamStatus,
        to: StreamStatus,
    },

    /// A message was created
    MessageAdded { message_id: String },

    /// A message's parts changed
    MessageUpdated { message_id: String },

    /// A tool call moved to a new state
    ToolCallChanged {
        message_id: String,
        call_id: String,
        tool_name: String,
        state: ToolCallState,
    },

    /// The confirmation gate opened or closed
    ConfirmationGate { pending: bool },

    /// The backend's gated tools differ from the local policy
    PolicyDrift {
        only_local: Vec<String>,
        only_remote: Vec<String>,
    },

    /// All messages were removed
    HistoryCleared,

    /// The stream failed
    Error { message: String },
}

impl ChatEvent {
    /// Check if this event ends a turn
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEvent::StatusChanged {
                to: StreamStatus::Idle | StreamStatus::Error,
                ..
            }
        )
    }
}
