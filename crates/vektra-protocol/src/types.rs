//! Core types for chat messages and their parts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker the backend puts on text it pushes on a schedule rather than in reply to a user.
pub const SCHEDULED_MARKER: &str = "scheduled message";
/// Full prefix stripped from scheduled text before display.
pub const SCHEDULED_PREFIX: &str = "scheduled message: ";

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single tool invocation.
///
/// States only move forward: `InputStreaming` -> `InputAvailable` ->
/// (`OutputAvailable` | `OutputError`). The two output states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    /// Arguments are still arriving
    InputStreaming,
    /// Arguments are complete; the call may be waiting on a human
    InputAvailable,
    /// The call produced a result
    OutputAvailable,
    /// The call failed or was cancelled
    OutputError,
}

impl ToolCallState {
    fn rank(self) -> u8 {
        match self {
            ToolCallState::InputStreaming => 0,
            ToolCallState::InputAvailable => 1,
            ToolCallState::OutputAvailable | ToolCallState::OutputError => 2,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether a call in this state may take `next`.
    ///
    /// Staying in the same non-terminal state is allowed so that fields
    /// (streamed input, for instance) can still be refreshed.
    pub fn can_advance_to(self, next: ToolCallState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    /// Get the wire name of this state
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCallState::InputStreaming => "input-streaming",
            ToolCallState::InputAvailable => "input-available",
            ToolCallState::OutputAvailable => "output-available",
            ToolCallState::OutputError => "output-error",
        }
    }
}

impl fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation embedded in an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPart {
    /// Tool name, carried as an explicit tag
    pub tool_name: String,
    /// Identifier of this call, unique within the conversation
    pub call_id: String,
    pub state: ToolCallState,
    /// Arguments (possibly partial while `InputStreaming`)
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Reason attached to an `OutputError` state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolCallPart {
    /// Create a tool call with no arguments yet
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        state: ToolCallState,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            call_id: call_id.into(),
            state,
            input: serde_json::Value::Null,
            output: None,
            error_text: None,
        }
    }

    /// Set the arguments
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Check if the call reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A fragment of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    /// Text content
    Text { text: String },
    /// Tool invocation record
    ToolCall(ToolCallPart),
}

impl Part {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get text if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Get the tool call if this is one
    pub fn as_tool_call(&self) -> Option<&ToolCallPart> {
        match self {
            Self::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    /// True for tool calls in `OutputAvailable` or `OutputError`; text is never terminal
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::ToolCall(call) => call.is_terminal(),
            Self::Text { .. } => false,
        }
    }

    /// Whether this text part was pushed by the backend's scheduler
    pub fn is_scheduled(&self) -> bool {
        self.as_text()
            .is_some_and(|text| text.starts_with(SCHEDULED_MARKER))
    }

    /// Text with the scheduled-message prefix removed, for display
    pub fn scheduled_body(&self) -> Option<&str> {
        self.as_text()
            .map(|text| text.strip_prefix(SCHEDULED_PREFIX).unwrap_or(text))
    }
}

/// Free-function form of [`Part::is_terminal`]
pub fn is_terminal_state(part: &Part) -> bool {
    part.is_terminal()
}

/// A chat message: an ordered list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
    /// Creation time, Unix milliseconds
    #[serde(default)]
    pub created_at: i64,
    /// Set once the owning stream has finished; streamed events no longer apply
    #[serde(default)]
    pub complete: bool,
}

impl Message {
    /// Create an empty message
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: vec![],
            created_at: chrono::Utc::now().timestamp_millis(),
            complete: false,
        }
    }

    /// Create a complete user message with a single text part
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::text(text)],
            complete: true,
            ..Self::new(id, Role::User)
        }
    }

    /// Create an empty assistant message, ready for streaming
    pub fn assistant(id: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant)
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Iterate over the tool calls in this message
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(Part::as_tool_call)
    }

    /// Find a tool call by id
    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallPart> {
        self.tool_calls().find(|c| c.call_id == call_id)
    }

    /// Find a tool call by id, mutably
    pub fn tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCallPart> {
        self.parts.iter_mut().find_map(|p| match p {
            Part::ToolCall(call) if call.call_id == call_id => Some(call),
            _ => None,
        })
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Canonical outputs the backend recognizes as a human decision on a gated call
pub mod approval {
    pub const YES: &str = "Yes, confirmed.";
    pub const NO: &str = "No, denied.";
}
