//! Event scripts: JSONL files of protocol events replayed as backend responses

use anyhow::Context;
use std::path::Path;
use vektra_protocol::{ProtocolEvent, codec};

/// Load a script and split it into one response per terminal event
pub fn load(path: &Path) -> anyhow::Result<Vec<Vec<ProtocolEvent>>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse(&body).with_context(|| format!("Invalid script {}", path.display()))
}

/// Parse script text into responses
pub fn parse(body: &str) -> anyhow::Result<Vec<Vec<ProtocolEvent>>> {
    let events = codec::decode_lines(body)?;
    Ok(split_responses(events))
}

/// Group events into responses.
///
/// Each `stream-end` or `stream-error` closes a response. Trailing events with
/// no terminal form a final response that stays open until stopped.
pub fn split_responses(events: Vec<ProtocolEvent>) -> Vec<Vec<ProtocolEvent>> {
    let mut responses = vec![];
    let mut current = vec![];
    for event in events {
        let terminal = event.is_terminal();
        current.push(event);
        if terminal {
            responses.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tracing::debug!("Script ends with an open response of {} events", current.len());
        responses.push(current);
    }
    responses
}
