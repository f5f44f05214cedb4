//! Line codec for protocol events
//!
//! Inbound events are one JSON object per line. Lines may carry an SSE
//! `data:` prefix; blank lines and `:` comment lines are skipped.

use crate::error::{Error, Result};
use crate::stream::{OutgoingEvent, ProtocolEvent};

/// Decode a single line. Returns `Ok(None)` for lines that carry no event.
pub fn decode_line(line: &str) -> Result<Option<ProtocolEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    let payload = line
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(line);
    if payload == "[DONE]" {
        return Ok(Some(ProtocolEvent::StreamEnd));
    }
    Ok(Some(serde_json::from_str(payload)?))
}

/// Decode every event in a multi-line body, reporting the 1-based line of the first failure
pub fn decode_lines(body: &str) -> Result<Vec<ProtocolEvent>> {
    let mut events = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        match decode_line(line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(Error::Json(source)) => {
                return Err(Error::Decode {
                    line: idx + 1,
                    source,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(events)
}

/// Encode an outgoing event as a single JSON line
pub fn encode_outgoing(event: &OutgoingEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}
