//! Slash commands for interactive mode

use vektra_chat::AwaitingConfirmation;

/// Result of executing a slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Approve a gated tool call
    Approve(String),
    /// Deny a gated tool call
    Deny(String),
    /// Stop the current response
    Stop,
    /// Clear the conversation
    Clear,
    /// Toggle raw message output
    ToggleDebug,
    /// Show a message to the user (not sent to the backend)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
pub fn execute_command(input: &str, awaiting: &[AwaitingConfirmation]) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "approve" | "a" | "yes" | "y" => match resolve_call(args, awaiting) {
            Ok(call_id) => CommandResult::Approve(call_id),
            Err(msg) => CommandResult::Message(msg),
        },

        "deny" | "d" | "no" | "n" => match resolve_call(args, awaiting) {
            Ok(call_id) => CommandResult::Deny(call_id),
            Err(msg) => CommandResult::Message(msg),
        },

        "stop" => CommandResult::Stop,

        "clear" | "c" => CommandResult::Clear,

        "debug" => CommandResult::ToggleDebug,

        "quit" | "exit" | "q" => CommandResult::Exit,

        _ => CommandResult::Unknown(command),
    })
}

/// Pick the call a decision applies to. Without an explicit id, the single
/// waiting call is used.
fn resolve_call(args: &str, awaiting: &[AwaitingConfirmation]) -> Result<String, String> {
    if !args.is_empty() {
        return Ok(args.to_string());
    }
    match awaiting {
        [] => Err("No tool call is waiting for confirmation.".to_string()),
        [only] => Ok(only.call_id.clone()),
        many => Err(format!(
            "Several tool calls are waiting, name one: {}",
            many.iter()
                .map(|a| a.call_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /approve, /a [callId]  Approve a tool call waiting for confirmation
  /deny, /d [callId]     Deny a tool call waiting for confirmation
  /stop                  Stop the current response
  /clear, /c             Clear conversation history
  /debug                 Toggle raw message output
  /quit, /exit, /q       Exit vektra

Examples:
  /approve               Approve the only waiting call
  /deny call_42          Deny a specific call"#
        .to_string()
}
