//! Streaming protocol events and part merging

use crate::types::{Message, Part, Role, ToolCallPart, ToolCallState};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events received from the agent backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ProtocolEvent {
    /// A message begins (or an earlier one is continued)
    MessageStart {
        id: String,
        role: Role,
        /// Server-side creation time, Unix milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_at: Option<i64>,
    },
    /// Text appended to the part at `part_index`
    TextDelta {
        message_id: String,
        part_index: usize,
        text_chunk: String,
    },
    /// New or updated tool call
    ToolCallDelta {
        message_id: String,
        call_id: String,
        tool_name: String,
        state: ToolCallState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
    },
    /// Message completed
    MessageEnd { message_id: String },
    /// Backend advertises which of its tools wait for human confirmation
    ToolManifest { confirmation_required: Vec<String> },
    /// Stream failed
    StreamError { reason: String },
    /// Stream closed normally
    StreamEnd,
}

impl ProtocolEvent {
    /// Check if this event closes the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolEvent::StreamEnd | ProtocolEvent::StreamError { .. }
        )
    }

    /// The message this event targets, if any
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ProtocolEvent::MessageStart { id, .. } => Some(id),
            ProtocolEvent::TextDelta { message_id, .. }
            | ProtocolEvent::ToolCallDelta { message_id, .. }
            | ProtocolEvent::MessageEnd { message_id } => Some(message_id),
            _ => None,
        }
    }

    /// Convert a delta event into the part update it carries
    pub fn incoming_part(&self) -> Option<IncomingPart> {
        match self {
            ProtocolEvent::TextDelta {
                part_index,
                text_chunk,
                ..
            } => Some(IncomingPart::TextDelta {
                index: *part_index,
                chunk: text_chunk.clone(),
            }),
            ProtocolEvent::ToolCallDelta {
                call_id,
                tool_name,
                state,
                input,
                output,
                error_text,
                ..
            } => Some(IncomingPart::ToolCall(ToolCallUpdate {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                state: *state,
                input: input.clone(),
                output: output.clone(),
                error_text: error_text.clone(),
            })),
            _ => None,
        }
    }
}

/// Events sent to the agent backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutgoingEvent {
    /// A user submission
    UserMessage {
        message_id: String,
        text: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    /// Result (or human decision) for a tool call
    ToolResult {
        call_id: String,
        tool_name: String,
        output: serde_json::Value,
    },
    /// Stop delivering the current stream
    Cancel,
}

impl OutgoingEvent {
    /// Whether the backend answers this event with a new stream
    pub fn opens_stream(&self) -> bool {
        !matches!(self, OutgoingEvent::Cancel)
    }
}

/// A stream of protocol events
pub type ProtocolEventStream = Pin<Box<dyn Stream<Item = ProtocolEvent> + Send>>;

/// A part update extracted from a delta event
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingPart {
    /// Text chunk for the part at `index`
    TextDelta { index: usize, chunk: String },
    /// Tool call identified by its call id
    ToolCall(ToolCallUpdate),
}

/// Fields of a tool call update; `None` leaves the current value in place
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallUpdate {
    pub call_id: String,
    pub tool_name: String,
    pub state: ToolCallState,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_text: Option<String>,
}

impl ToolCallUpdate {
    fn into_part(self) -> ToolCallPart {
        ToolCallPart {
            tool_name: self.tool_name,
            call_id: self.call_id,
            state: self.state,
            input: self.input.unwrap_or_default(),
            output: self.output,
            error_text: self.error_text,
        }
    }
}

/// What [`append_or_update_part`] did with an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new part was added at the end
    Appended,
    /// An existing part changed
    Updated,
    /// Nothing changed: duplicate, stale, or aimed at a terminal call
    Ignored,
    /// The update disagrees with the part already at its position
    Conflict,
}

impl MergeOutcome {
    /// Whether the message was modified
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Appended | MergeOutcome::Updated)
    }
}

/// Largest run of missing parts a text delta may skip over
pub const MAX_PART_GAP: usize = 64;

/// Merge an incoming part into a message.
///
/// Text deltas concatenate onto the text part at their index; a gap of up to
/// [`MAX_PART_GAP`] missing indices is filled with empty text parts. Tool calls are matched by call id
/// and only ever move forward through [`ToolCallState`]. Parts are never
/// removed or reordered.
pub fn append_or_update_part(message: &mut Message, incoming: IncomingPart) -> MergeOutcome {
    match incoming {
        IncomingPart::TextDelta { index, chunk } => merge_text(message, index, &chunk),
        IncomingPart::ToolCall(update) => merge_tool_call(message, update),
    }
}

fn merge_text(message: &mut Message, index: usize, chunk: &str) -> MergeOutcome {
    if index < message.parts.len() {
        return match &mut message.parts[index] {
            Part::Text { text } => {
                if chunk.is_empty() {
                    return MergeOutcome::Ignored;
                }
                text.push_str(chunk);
                MergeOutcome::Updated
            }
            Part::ToolCall(call) => {
                tracing::warn!(
                    "Text delta for part {} of message {} hits tool call {}",
                    index,
                    message.id,
                    call.call_id
                );
                MergeOutcome::Conflict
            }
        };
    }

    let gap = index - message.parts.len();
    if gap > MAX_PART_GAP {
        tracing::warn!(
            "Text delta for part {} of message {} is {} positions past its last part, ignoring",
            index,
            message.id,
            gap
        );
        return MergeOutcome::Conflict;
    }
    if gap > 0 {
        tracing::debug!(
            "Text delta for part {} of message {} skips {} positions, padding",
            index,
            message.id,
            gap
        );
    }
    while message.parts.len() < index {
        message.parts.push(Part::text(""));
    }
    message.parts.push(Part::text(chunk));
    MergeOutcome::Appended
}

fn merge_tool_call(message: &mut Message, update: ToolCallUpdate) -> MergeOutcome {
    let message_id = message.id.clone();
    let Some(existing) = message.tool_call_mut(&update.call_id) else {
        message.parts.push(Part::ToolCall(update.into_part()));
        return MergeOutcome::Appended;
    };

    if existing.tool_name != update.tool_name {
        tracing::warn!(
            "Tool call {} in message {} changed name from '{}' to '{}', ignoring update",
            existing.call_id,
            message_id,
            existing.tool_name,
            update.tool_name
        );
        return MergeOutcome::Conflict;
    }

    if !existing.state.can_advance_to(update.state) {
        tracing::debug!(
            "Ignoring {} update for tool call {} already in {}",
            update.state,
            existing.call_id,
            existing.state
        );
        return MergeOutcome::Ignored;
    }

    let before = existing.clone();
    existing.state = update.state;
    if let Some(input) = update.input {
        existing.input = input;
    }
    if let Some(output) = update.output {
        existing.output = Some(output);
    }
    if let Some(error_text) = update.error_text {
        existing.error_text = Some(error_text);
    }

    if *existing == before {
        MergeOutcome::Ignored
    } else {
        MergeOutcome::Updated
    }
}
