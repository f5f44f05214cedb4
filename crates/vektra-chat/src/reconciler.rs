//! Turn reconciler: folds protocol events and commands into conversation state

use tokio::sync::broadcast;
use vektra_protocol::{
    IncomingPart, Message, OutgoingEvent, ProtocolEvent, Role, ToolCallState,
    append_or_update_part, approval,
};

use crate::{
    conversation::{
        AwaitingConfirmation, ConversationState, StreamStatus, awaiting_confirmation,
        pending_confirmation,
    },
    error::{Error, Result},
    events::ChatEvent,
    policy::ConfirmationPolicy,
};

/// Reason recorded on tool calls interrupted by [`Reconciler::stop`]
pub const CANCELLED_REASON: &str = "cancelled";

/// Identifies one response stream. Events tagged with anything other than the
/// active stream are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// What [`Reconciler::ingest`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// The state changed
    Applied,
    /// Accepted, but nothing changed (duplicate, stale, or sealed message)
    Unchanged,
    /// The event belongs to a stream that is no longer active
    Discarded,
}

/// An outgoing event together with the stream its response belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub stream: StreamId,
    pub event: OutgoingEvent,
}

/// The conversation state machine.
///
/// All transitions are synchronous: each call either applies fully or returns
/// an error without touching the state. Sending outgoing events is left to the
/// caller.
pub struct Reconciler {
    state: ConversationState,
    /// Policy in force (may be replaced by a backend manifest)
    policy: ConfirmationPolicy,
    /// Policy configured at startup, kept for drift reports
    configured_policy: ConfirmationPolicy,
    trust_advertised: bool,
    active_stream: Option<StreamId>,
    /// Last stream closed by `stream-end`
    ended_stream: Option<StreamId>,
    next_stream: u64,
    draft: String,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl Reconciler {
    /// Create a reconciler with the given confirmation policy
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self::with_capacity(policy, 256)
    }

    /// Create a reconciler whose event channel holds `capacity` events
    pub fn with_capacity(policy: ConfirmationPolicy, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: ConversationState::default(),
            configured_policy: policy.clone(),
            policy,
            trust_advertised: true,
            active_stream: None,
            ended_stream: None,
            next_stream: 0,
            draft: String::new(),
            event_tx,
        }
    }

    /// Whether a backend tool manifest replaces the configured policy
    pub fn set_trust_advertised(&mut self, trust: bool) {
        self.trust_advertised = trust;
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    /// Get the current state
    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Clone the current state for a consumer
    pub fn snapshot(&self) -> ConversationState {
        self.state.clone()
    }

    /// Get the policy in force
    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    /// The stream whose events are currently accepted
    pub fn active_stream(&self) -> Option<StreamId> {
        self.active_stream
    }

    /// Gated tool calls waiting for a decision
    pub fn awaiting_confirmation(&self) -> Vec<AwaitingConfirmation> {
        awaiting_confirmation(&self.state.messages, &self.policy)
    }

    // ---- Input buffer ----

    /// Replace the composer draft
    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Submit the draft. On failure the draft is kept.
    pub fn submit_draft(&mut self, metadata: serde_json::Value) -> Result<Submission> {
        let text = self.draft.clone();
        self.submit_user_message(&text, metadata)
    }

    // ---- Commands ----

    /// Append a user message and open a new turn.
    ///
    /// The message is added immediately, before the backend has seen it.
    pub fn submit_user_message(
        &mut self,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<Submission> {
        if text.trim().is_empty() {
            return Err(Error::Validation("message text is empty".to_string()));
        }
        if self.state.pending_confirmation {
            return Err(Error::InvalidState(
                "a tool call is waiting for confirmation".to_string(),
            ));
        }
        if self.state.stream_status.is_active() {
            return Err(Error::InvalidState(format!(
                "a response is already {}",
                self.state.stream_status
            )));
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        self.state
            .messages
            .push(Message::user(message_id.clone(), text));
        self.draft.clear();
        self.emit(ChatEvent::MessageAdded {
            message_id: message_id.clone(),
        });

        let stream = self.open_stream();
        Ok(Submission {
            stream,
            event: OutgoingEvent::UserMessage {
                message_id,
                text: text.to_string(),
                metadata,
            },
        })
    }

    /// Record the result of a tool call and forward it to the backend.
    ///
    /// If no stream is active a new one is opened for the backend's
    /// continuation; otherwise the result rides on the current stream. When
    /// the backend answers a ride-along result with a stream of its own, hand
    /// the turn over with [`Reconciler::continue_stream`].
    pub fn supply_tool_result(
        &mut self,
        call_id: &str,
        output: serde_json::Value,
    ) -> Result<Submission> {
        let Some(message) = self
            .state
            .messages
            .iter_mut()
            .find(|m| m.tool_call(call_id).is_some())
        else {
            return Err(Error::NotFound(call_id.to_string()));
        };
        let message_id = message.id.clone();
        let Some(call) = message.tool_call_mut(call_id) else {
            return Err(Error::NotFound(call_id.to_string()));
        };
        if call.is_terminal() {
            return Err(Error::InvalidState(format!(
                "tool call {} is already {}",
                call_id, call.state
            )));
        }

        call.state = ToolCallState::OutputAvailable;
        call.output = Some(output.clone());
        let tool_name = call.tool_name.clone();

        self.emit(ChatEvent::ToolCallChanged {
            message_id: message_id.clone(),
            call_id: call_id.to_string(),
            tool_name: tool_name.clone(),
            state: ToolCallState::OutputAvailable,
        });
        self.emit(ChatEvent::MessageUpdated { message_id });
        self.refresh_gate();

        let stream = match self.active_stream {
            Some(stream) => stream,
            None => self.open_stream(),
        };
        Ok(Submission {
            stream,
            event: OutgoingEvent::ToolResult {
                call_id: call_id.to_string(),
                tool_name,
                output,
            },
        })
    }

    /// Approve a gated call
    pub fn approve(&mut self, call_id: &str) -> Result<Submission> {
        self.supply_tool_result(call_id, serde_json::Value::from(approval::YES))
    }

    /// Deny a gated call
    pub fn deny(&mut self, call_id: &str) -> Result<Submission> {
        self.supply_tool_result(call_id, serde_json::Value::from(approval::NO))
    }

    /// Stop the current stream.
    ///
    /// Tool calls still receiving input are closed as `OutputError` with
    /// reason [`CANCELLED_REASON`]. Returns the cancel event to send when a
    /// stream was in flight. No-op when idle.
    pub fn stop(&mut self) -> Option<OutgoingEvent> {
        if self.state.stream_status == StreamStatus::Idle {
            return None;
        }
        let was_active = self.state.stream_status.is_active();
        if let Some(stream) = self.active_stream.take() {
            tracing::info!("Stopping {}", stream);
        }
        self.interrupt_streaming_calls(CANCELLED_REASON);
        self.seal_messages();
        self.state.error = None;
        self.set_status(StreamStatus::Idle);
        self.refresh_gate();
        was_active.then_some(OutgoingEvent::Cancel)
    }

    /// Remove every message and cancel any active stream
    pub fn clear_history(&mut self) -> Option<OutgoingEvent> {
        let cancel = self.stop();
        self.state.messages.clear();
        self.state.error = None;
        self.set_status(StreamStatus::Idle);
        self.emit(ChatEvent::HistoryCleared);
        self.refresh_gate();
        cancel
    }

    /// Open a stream the backend started on its own (a scheduled message, say)
    pub fn accept_stream(&mut self) -> Result<StreamId> {
        if self.state.stream_status.is_active() {
            return Err(Error::InvalidState(format!(
                "a response is already {}",
                self.state.stream_status
            )));
        }
        Ok(self.open_stream())
    }

    /// Move the turn from `stream` onto a new stream carrying the backend's
    /// reply to a result sent while `stream` was open.
    ///
    /// From then on events still in flight on `stream` are discarded. Returns
    /// `None` when `stream` was stopped, failed, or replaced by another turn.
    pub fn continue_stream(&mut self, stream: StreamId) -> Option<StreamId> {
        let resumable = match self.active_stream {
            Some(active) => active == stream,
            None => self.ended_stream == Some(stream),
        };
        if !resumable {
            tracing::debug!("{} is gone, not continuing it", stream);
            return None;
        }
        let next = self.open_stream();
        tracing::debug!("{} continues on {}", stream, next);
        Some(next)
    }

    // ---- Stream ingestion ----

    /// Apply one protocol event received on `stream`
    pub fn ingest(&mut self, stream: StreamId, event: ProtocolEvent) -> Ingest {
        if self.active_stream != Some(stream) {
            tracing::debug!("Discarding event from inactive {}: {:?}", stream, event);
            return Ingest::Discarded;
        }
        if self.state.stream_status == StreamStatus::Submitted && !event.is_terminal() {
            self.set_status(StreamStatus::Streaming);
        }

        let result = match event {
            ProtocolEvent::MessageStart {
                id,
                role,
                created_at,
            } => self.start_message(id, role, created_at),
            ProtocolEvent::TextDelta { .. } | ProtocolEvent::ToolCallDelta { .. } => {
                self.apply_delta(&event)
            }
            ProtocolEvent::MessageEnd { message_id } => self.end_message(&message_id),
            ProtocolEvent::ToolManifest {
                confirmation_required,
            } => self.apply_manifest(confirmation_required),
            ProtocolEvent::StreamError { reason } => {
                self.fail_active(reason);
                Ingest::Applied
            }
            ProtocolEvent::StreamEnd => {
                self.finish();
                Ingest::Applied
            }
        };

        self.refresh_gate();
        result
    }

    /// Record a transport failure on `stream`. Partial messages are kept.
    pub fn fail(&mut self, stream: StreamId, reason: impl Into<String>) -> Ingest {
        if self.active_stream != Some(stream) {
            return Ingest::Discarded;
        }
        self.fail_active(reason.into());
        self.refresh_gate();
        Ingest::Applied
    }

    fn start_message(&mut self, id: String, role: Role, created_at: Option<i64>) -> Ingest {
        if let Some(existing) = self.state.messages.iter_mut().find(|m| m.id == id) {
            if existing.role != role {
                tracing::warn!(
                    "message-start for {} as {} but it is a {} message",
                    id,
                    role,
                    existing.role
                );
                return Ingest::Unchanged;
            }
            if existing.is_assistant() && existing.complete {
                existing.complete = false;
                tracing::debug!("Continuing message {}", id);
                return Ingest::Applied;
            }
            return Ingest::Unchanged;
        }

        let mut message = Message::new(id.clone(), role);
        if let Some(created_at) = created_at {
            message.created_at = created_at;
        }
        self.state.messages.push(message);
        self.emit(ChatEvent::MessageAdded { message_id: id });
        Ingest::Applied
    }

    fn apply_delta(&mut self, event: &ProtocolEvent) -> Ingest {
        let (Some(message_id), Some(incoming)) = (event.message_id(), event.incoming_part())
        else {
            return Ingest::Unchanged;
        };

        if let IncomingPart::ToolCall(update) = &incoming {
            let elsewhere = self
                .state
                .messages
                .iter()
                .any(|m| m.id != message_id && m.tool_call(&update.call_id).is_some());
            if elsewhere {
                tracing::warn!(
                    "Tool call {} already belongs to another message, ignoring delta for {}",
                    update.call_id,
                    message_id
                );
                return Ingest::Unchanged;
            }
        }

        let idx = match self.state.messages.iter().position(|m| m.id == message_id) {
            Some(idx) => idx,
            None => {
                self.state.messages.push(Message::assistant(message_id));
                self.emit(ChatEvent::MessageAdded {
                    message_id: message_id.to_string(),
                });
                self.state.messages.len() - 1
            }
        };

        let message = &mut self.state.messages[idx];
        if message.complete {
            tracing::debug!("Ignoring delta for completed message {}", message_id);
            return Ingest::Unchanged;
        }

        let call_state = match &incoming {
            IncomingPart::ToolCall(update) => message.tool_call(&update.call_id).map(|c| c.state),
            IncomingPart::TextDelta { .. } => None,
        };
        let tool_call = match &incoming {
            IncomingPart::ToolCall(update) => {
                Some((update.call_id.clone(), update.tool_name.clone()))
            }
            IncomingPart::TextDelta { .. } => None,
        };

        let outcome = append_or_update_part(message, incoming);
        if !outcome.changed() {
            return Ingest::Unchanged;
        }

        if let Some((call_id, tool_name)) = tool_call {
            let new_state = message.tool_call(&call_id).map(|c| c.state);
            if let Some(state) = new_state.filter(|s| Some(*s) != call_state) {
                self.emit(ChatEvent::ToolCallChanged {
                    message_id: message_id.to_string(),
                    call_id,
                    tool_name,
                    state,
                });
            }
        }
        self.emit(ChatEvent::MessageUpdated {
            message_id: message_id.to_string(),
        });
        Ingest::Applied
    }

    fn end_message(&mut self, message_id: &str) -> Ingest {
        match self.state.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) if !message.complete => {
                message.complete = true;
                Ingest::Applied
            }
            Some(_) => Ingest::Unchanged,
            None => {
                tracing::debug!("message-end for unknown message {}", message_id);
                Ingest::Unchanged
            }
        }
    }

    fn apply_manifest(&mut self, tools: Vec<String>) -> Ingest {
        let advertised = ConfirmationPolicy::new(tools);
        let drift = self.configured_policy.drift(&advertised);
        if !drift.is_empty() {
            tracing::warn!(
                "Confirmation policy drift: gated only locally {:?}, only by backend {:?}",
                drift.only_local,
                drift.only_remote
            );
            self.emit(ChatEvent::PolicyDrift {
                only_local: drift.only_local,
                only_remote: drift.only_remote,
            });
        }

        if self.trust_advertised && advertised != self.policy {
            self.policy = advertised;
            Ingest::Applied
        } else {
            Ingest::Unchanged
        }
    }

    // ---- Helpers ----

    fn open_stream(&mut self) -> StreamId {
        self.next_stream += 1;
        let stream = StreamId(self.next_stream);
        self.active_stream = Some(stream);
        self.state.error = None;
        self.set_status(StreamStatus::Submitted);
        stream
    }

    fn finish(&mut self) {
        self.ended_stream = self.active_stream.take();
        self.seal_messages();
        self.set_status(StreamStatus::Idle);
    }

    fn fail_active(&mut self, reason: String) {
        tracing::warn!("Stream failed: {}", reason);
        self.active_stream = None;
        self.interrupt_streaming_calls(&reason);
        self.seal_messages();
        self.state.error = Some(reason.clone());
        self.set_status(StreamStatus::Error);
        self.emit(ChatEvent::Error { message: reason });
    }

    /// Close every tool call still in `InputStreaming` as `OutputError`
    fn interrupt_streaming_calls(&mut self, reason: &str) {
        let mut changed = vec![];
        for message in &mut self.state.messages {
            for part in &mut message.parts {
                if let vektra_protocol::Part::ToolCall(call) = part {
                    if call.state == ToolCallState::InputStreaming {
                        call.state = ToolCallState::OutputError;
                        call.error_text = Some(reason.to_string());
                        changed.push(ChatEvent::ToolCallChanged {
                            message_id: message.id.clone(),
                            call_id: call.call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            state: ToolCallState::OutputError,
                        });
                    }
                }
            }
        }
        for event in changed {
            self.emit(event);
        }
    }

    fn seal_messages(&mut self) {
        for message in &mut self.state.messages {
            message.complete = true;
        }
    }

    fn set_status(&mut self, to: StreamStatus) {
        let from = self.state.stream_status;
        if from == to {
            return;
        }
        tracing::info!("Stream status {} -> {}", from, to);
        self.state.stream_status = to;
        self.emit(ChatEvent::StatusChanged { from, to });
    }

    fn refresh_gate(&mut self) {
        let pending = pending_confirmation(&self.state.messages, &self.policy);
        if pending != self.state.pending_confirmation {
            self.state.pending_confirmation = pending;
            self.emit(ChatEvent::ConfirmationGate { pending });
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vektra_protocol::Part;

    fn reconciler() -> Reconciler {
        Reconciler::new(ConfirmationPolicy::new(["getWeatherInformation"]))
    }

    fn start(id: &str) -> ProtocolEvent {
        ProtocolEvent::MessageStart {
            id: id.into(),
            role: Role::Assistant,
            created_at: None,
        }
    }

    fn text(message_id: &str, part_index: usize, chunk: &str) -> ProtocolEvent {
        ProtocolEvent::TextDelta {
            message_id: message_id.into(),
            part_index,
            text_chunk: chunk.into(),
        }
    }

    fn tool(message_id: &str, call_id: &str, name: &str, state: ToolCallState) -> ProtocolEvent {
        ProtocolEvent::ToolCallDelta {
            message_id: message_id.into(),
            call_id: call_id.into(),
            tool_name: name.into(),
            state,
            input: None,
            output: None,
            error_text: None,
        }
    }

    fn submitted(r: &mut Reconciler, text: &str) -> StreamId {
        r.submit_user_message(text, serde_json::Value::Null)
            .unwrap()
            .stream
    }

    /// Submit, then bring c1 to `input-available` on a gated tool.
    fn gated(r: &mut Reconciler) -> StreamId {
        let s = submitted(r, "What's the weather in Lisbon?");
        r.ingest(s, start("a1"));
        r.ingest(
            s,
            tool("a1", "c1", "getWeatherInformation", ToolCallState::InputAvailable),
        );
        r.ingest(s, ProtocolEvent::StreamEnd);
        s
    }

    #[test]
    fn test_submit_appends_user_message() {
        let mut r = reconciler();
        let submission = r.submit_user_message("Hello", json!({"annotations": {"hello": "world"}})).unwrap();

        let state = r.state();
        assert_eq!(state.stream_status, StreamStatus::Submitted);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[0].parts, vec![Part::text("Hello")]);
        assert_eq!(r.active_stream(), Some(submission.stream));

        match submission.event {
            OutgoingEvent::UserMessage {
                message_id,
                text,
                metadata,
            } => {
                assert_eq!(message_id, state.messages[0].id);
                assert_eq!(text, "Hello");
                assert_eq!(metadata["annotations"]["hello"], "world");
            }
            other => panic!("expected user message, got {:?}", other),
        }
    }

    #[test]
    fn test_submit_rejects_blank_text() {
        let mut r = reconciler();
        for text in ["", "   ", "\n\t"] {
            let err = r.submit_user_message(text, json!({})).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "got {:?}", err);
        }
        assert!(r.state().messages.is_empty());
        assert_eq!(r.state().stream_status, StreamStatus::Idle);
    }

    #[test]
    fn test_submit_rejected_while_streaming() {
        let mut r = reconciler();
        submitted(&mut r, "first");
        let before = r.snapshot();
        let err = r.submit_user_message("second", json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn test_status_lifecycle() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        assert_eq!(r.state().stream_status, StreamStatus::Submitted);

        r.ingest(s, start("a1"));
        assert_eq!(r.state().stream_status, StreamStatus::Streaming);

        r.ingest(s, text("a1", 0, "Hello"));
        r.ingest(s, text("a1", 0, " there"));
        r.ingest(s, ProtocolEvent::MessageEnd { message_id: "a1".into() });
        r.ingest(s, ProtocolEvent::StreamEnd);

        assert_eq!(r.state().stream_status, StreamStatus::Idle);
        assert_eq!(r.active_stream(), None);
        assert_eq!(r.state().message("a1").unwrap().text(), "Hello there");
    }

    #[test]
    fn test_delta_creates_message() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        assert_eq!(r.ingest(s, text("a1", 0, "Hey")), Ingest::Applied);
        let msg = r.state().message("a1").unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.text(), "Hey");
    }

    #[test]
    fn test_server_created_at_is_kept() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.ingest(
            s,
            ProtocolEvent::MessageStart {
                id: "a1".into(),
                role: Role::Assistant,
                created_at: Some(1_700_000_000_000),
            },
        );
        assert_eq!(r.state().message("a1").unwrap().created_at, 1_700_000_000_000);
    }

    #[test]
    fn test_gated_call_blocks_submit() {
        let mut r = reconciler();
        gated(&mut r);
        assert!(r.state().pending_confirmation);
        assert!(!r.state().input_enabled());

        let err = r.submit_user_message("Anything else?", json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(r.state().messages.len(), 2);

        let waiting = r.awaiting_confirmation();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].call_id, "c1");
    }

    #[test]
    fn test_autonomous_call_does_not_gate() {
        let mut r = reconciler();
        let s = submitted(&mut r, "What time is it?");
        r.ingest(s, tool("a1", "c1", "getLocalTime", ToolCallState::InputAvailable));
        assert!(!r.state().pending_confirmation);
    }

    #[test]
    fn test_supply_tool_result_resolves_gate() {
        let mut r = reconciler();
        gated(&mut r);

        let submission = r.supply_tool_result("c1", json!({"temp": 72})).unwrap();
        let call = r.state().tool_call("c1").unwrap();
        assert_eq!(call.state, ToolCallState::OutputAvailable);
        assert_eq!(call.output, Some(json!({"temp": 72})));
        assert!(!r.state().pending_confirmation);

        assert_eq!(
            submission.event,
            OutgoingEvent::ToolResult {
                call_id: "c1".into(),
                tool_name: "getWeatherInformation".into(),
                output: json!({"temp": 72}),
            }
        );
        // The backend resumes on a fresh stream
        assert_eq!(r.state().stream_status, StreamStatus::Submitted);
        assert_eq!(r.active_stream(), Some(submission.stream));
    }

    #[test]
    fn test_supply_tool_result_twice_fails() {
        let mut r = reconciler();
        gated(&mut r);
        let first = r.supply_tool_result("c1", json!({"temp": 72})).unwrap();
        r.ingest(first.stream, ProtocolEvent::StreamEnd);

        let before = r.snapshot();
        let err = r.supply_tool_result("c1", json!({"temp": 10})).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "got {:?}", err);
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn test_supply_unknown_call_fails() {
        let mut r = reconciler();
        let err = r.supply_tool_result("nope", json!(null)).unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "nope"));
    }

    #[test]
    fn test_approve_and_deny_use_canonical_outputs() {
        let mut r = reconciler();
        gated(&mut r);
        let approved = r.approve("c1").unwrap();
        match approved.event {
            OutgoingEvent::ToolResult { output, .. } => assert_eq!(output, json!("Yes, confirmed.")),
            other => panic!("unexpected {:?}", other),
        }
        r.ingest(approved.stream, ProtocolEvent::StreamEnd);

        let s = submitted(&mut r, "And Porto?");
        r.ingest(s, tool("a2", "c2", "getWeatherInformation", ToolCallState::InputAvailable));
        r.ingest(s, ProtocolEvent::StreamEnd);
        let denied = r.deny("c2").unwrap();
        match denied.event {
            OutgoingEvent::ToolResult { output, .. } => assert_eq!(output, json!("No, denied.")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stop_cancels_streaming_calls() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Weather?");
        r.ingest(s, tool("a1", "c1", "getWeatherInformation", ToolCallState::InputStreaming));

        assert_eq!(r.stop(), Some(OutgoingEvent::Cancel));
        let call = r.state().tool_call("c1").unwrap();
        assert_eq!(call.state, ToolCallState::OutputError);
        assert_eq!(call.error_text.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(r.state().stream_status, StreamStatus::Idle);
        assert!(r.state().error.is_none());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut r = reconciler();
        let before = r.snapshot();
        assert_eq!(r.stop(), None);
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn test_events_after_stop_are_discarded() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Tell me a story");
        r.ingest(s, text("a1", 0, "Once"));
        r.stop();

        let before = r.snapshot();
        assert_eq!(r.ingest(s, text("a1", 0, " upon")), Ingest::Discarded);
        assert_eq!(r.ingest(s, ProtocolEvent::StreamEnd), Ingest::Discarded);
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn test_clear_history() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.ingest(s, text("a1", 0, "Hello"));

        assert_eq!(r.clear_history(), Some(OutgoingEvent::Cancel));
        assert!(r.state().messages.is_empty());
        assert_eq!(r.state().stream_status, StreamStatus::Idle);
        assert_eq!(r.active_stream(), None);
        assert_eq!(r.ingest(s, text("a1", 0, "late")), Ingest::Discarded);

        // Idle history clear sends nothing
        assert_eq!(r.clear_history(), None);
    }

    #[test]
    fn test_clear_history_releases_gate() {
        let mut r = reconciler();
        gated(&mut r);
        r.clear_history();
        assert!(!r.state().pending_confirmation);
        assert!(r.submit_user_message("fresh start", json!({})).is_ok());
    }

    #[test]
    fn test_stream_error_keeps_partial_messages() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.ingest(s, text("a1", 0, "Partial"));
        r.ingest(s, tool("a1", "c1", "getLocalTime", ToolCallState::InputStreaming));
        r.ingest(
            s,
            ProtocolEvent::StreamError {
                reason: "connection reset".into(),
            },
        );

        let state = r.state();
        assert_eq!(state.stream_status, StreamStatus::Error);
        assert_eq!(state.error.as_deref(), Some("connection reset"));
        assert_eq!(state.message("a1").unwrap().text(), "Partial");
        assert_eq!(state.tool_call("c1").unwrap().state, ToolCallState::OutputError);

        // Resubmission is explicit and clears the error
        submitted(&mut r, "Try again");
        assert_eq!(r.state().stream_status, StreamStatus::Submitted);
        assert!(r.state().error.is_none());
    }

    #[test]
    fn test_transport_failure_on_stale_stream_is_discarded() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.stop();
        assert_eq!(r.fail(s, "late failure"), Ingest::Discarded);
        assert_eq!(r.state().stream_status, StreamStatus::Idle);
    }

    #[test]
    fn test_terminal_replay_is_noop() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Time?");
        let done = ProtocolEvent::ToolCallDelta {
            message_id: "a1".into(),
            call_id: "c1".into(),
            tool_name: "getLocalTime".into(),
            state: ToolCallState::OutputAvailable,
            input: Some(json!({"location": "Paris"})),
            output: Some(json!("10am")),
            error_text: None,
        };
        assert_eq!(r.ingest(s, done.clone()), Ingest::Applied);
        let before = r.snapshot();
        assert_eq!(r.ingest(s, done), Ingest::Unchanged);
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn test_text_replay_duplicates() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.ingest(s, text("a1", 0, "Hey"));
        r.ingest(s, text("a1", 0, "Hey"));
        assert_eq!(r.state().message("a1").unwrap().text(), "HeyHey");
    }

    #[test]
    fn test_duplicate_call_id_across_messages_is_ignored() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.ingest(s, tool("a1", "c1", "getLocalTime", ToolCallState::InputStreaming));
        assert_eq!(
            r.ingest(s, tool("a2", "c1", "getLocalTime", ToolCallState::InputAvailable)),
            Ingest::Unchanged
        );
        assert!(r.state().message("a2").is_none());
    }

    #[test]
    fn test_completed_messages_are_sealed() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.ingest(s, text("a1", 0, "Done."));
        r.ingest(s, ProtocolEvent::MessageEnd { message_id: "a1".into() });
        assert_eq!(r.ingest(s, text("a1", 0, " More")), Ingest::Unchanged);
        assert_eq!(r.state().message("a1").unwrap().text(), "Done.");

        // An explicit message-start continues it
        assert_eq!(r.ingest(s, start("a1")), Ingest::Applied);
        assert_eq!(r.ingest(s, text("a1", 1, " More")), Ingest::Applied);
        assert_eq!(r.state().message("a1").unwrap().text(), "Done. More");
    }

    #[test]
    fn test_parts_never_reorder_or_regress() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        let events = vec![
            text("a1", 0, "Let me check"),
            tool("a1", "c1", "getLocalTime", ToolCallState::InputStreaming),
            tool("a1", "c2", "getWeatherInformation", ToolCallState::InputStreaming),
            tool("a1", "c1", "getLocalTime", ToolCallState::OutputAvailable),
            tool("a1", "c1", "getLocalTime", ToolCallState::InputAvailable),
            text("a1", 0, "..."),
            tool("a1", "c2", "getWeatherInformation", ToolCallState::InputAvailable),
            tool("a1", "c2", "getWeatherInformation", ToolCallState::InputStreaming),
            text("a1", 3, "Done"),
        ];

        let mut previous: Vec<(String, Option<ToolCallState>)> = vec![];
        for event in events {
            r.ingest(s, event);
            let msg = r.state().message("a1").unwrap();
            let current: Vec<(String, Option<ToolCallState>)> = msg
                .parts
                .iter()
                .map(|p| match p {
                    Part::Text { .. } => ("text".to_string(), None),
                    Part::ToolCall(c) => (c.call_id.clone(), Some(c.state)),
                })
                .collect();
            assert!(current.len() >= previous.len());
            for (old, new) in previous.iter().zip(current.iter()) {
                assert_eq!(old.0, new.0, "parts reordered");
                if let (Some(a), Some(b)) = (old.1, new.1) {
                    assert!(a == b || a.can_advance_to(b), "{} regressed to {}", a, b);
                }
            }
            previous = current;
        }

        let msg = r.state().message("a1").unwrap();
        assert_eq!(msg.parts.len(), 4);
        assert_eq!(msg.tool_call("c1").unwrap().state, ToolCallState::OutputAvailable);
        assert_eq!(msg.tool_call("c2").unwrap().state, ToolCallState::InputAvailable);
        assert!(r.state().pending_confirmation);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let script = vec![
            ProtocolEvent::MessageStart {
                id: "a1".into(),
                role: Role::Assistant,
                created_at: Some(1_000),
            },
            text("a1", 0, "Sure, "),
            tool("a1", "c1", "getWeatherInformation", ToolCallState::InputStreaming),
            tool("a1", "c1", "getWeatherInformation", ToolCallState::InputAvailable),
            ProtocolEvent::MessageEnd { message_id: "a1".into() },
            ProtocolEvent::StreamEnd,
        ];
        let run = || {
            let mut r = reconciler();
            let s = submitted(&mut r, "Weather?");
            for event in script.clone() {
                r.ingest(s, event);
            }
            r.snapshot()
        };
        let (a, b) = (run(), run());
        // Ids and timestamps of the optimistic user message differ between runs
        assert_eq!(a.messages[1..], b.messages[1..]);
        assert_eq!(a.stream_status, b.stream_status);
        assert_eq!(a.pending_confirmation, b.pending_confirmation);
    }

    #[test]
    fn test_manifest_replaces_policy_and_reports_drift() {
        let mut r = reconciler();
        let mut rx = r.subscribe();
        let s = submitted(&mut r, "Hi");
        r.ingest(s, tool("a1", "c1", "sendEmail", ToolCallState::InputAvailable));
        assert!(!r.state().pending_confirmation);

        r.ingest(
            s,
            ProtocolEvent::ToolManifest {
                confirmation_required: vec!["getWeatherInformation".into(), "sendEmail".into()],
            },
        );
        assert!(r.policy().requires_confirmation("sendEmail"));
        assert!(r.state().pending_confirmation);

        let mut drift = None;
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::PolicyDrift { only_local, only_remote } = event {
                drift = Some((only_local, only_remote));
            }
        }
        assert_eq!(drift, Some((vec![], vec!["sendEmail".to_string()])));
    }

    #[test]
    fn test_manifest_ignored_when_untrusted() {
        let mut r = reconciler();
        r.set_trust_advertised(false);
        let s = submitted(&mut r, "Hi");
        assert_eq!(
            r.ingest(
                s,
                ProtocolEvent::ToolManifest {
                    confirmation_required: vec!["sendEmail".into()],
                }
            ),
            Ingest::Unchanged
        );
        assert!(!r.policy().requires_confirmation("sendEmail"));
        assert!(r.policy().requires_confirmation("getWeatherInformation"));
    }

    #[test]
    fn test_draft_cleared_on_submit_and_kept_on_failure() {
        let mut r = reconciler();
        r.set_draft("   ");
        assert!(r.submit_draft(json!({})).is_err());
        assert_eq!(r.draft(), "   ");

        r.set_draft("Hello");
        r.submit_draft(json!({})).unwrap();
        assert_eq!(r.draft(), "");
    }

    #[test]
    fn test_accept_stream() {
        let mut r = reconciler();
        let s = r.accept_stream().unwrap();
        assert_eq!(r.state().stream_status, StreamStatus::Submitted);
        r.ingest(s, text("sched-1", 0, "scheduled message: stand up and stretch"));
        r.ingest(s, ProtocolEvent::StreamEnd);

        let msg = r.state().message("sched-1").unwrap();
        assert!(msg.parts[0].is_scheduled());
        assert!(matches!(r.accept_stream(), Ok(_)));
        assert!(matches!(r.accept_stream(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_result_mid_stream_continues_on_new_stream() {
        let mut r = reconciler();
        let s = submitted(&mut r, "What's the weather in Lisbon?");
        r.ingest(s, start("a1"));
        r.ingest(
            s,
            tool("a1", "c1", "getWeatherInformation", ToolCallState::InputAvailable),
        );
        assert_eq!(r.state().stream_status, StreamStatus::Streaming);

        let submission = r.approve("c1").unwrap();
        assert_eq!(submission.stream, s);

        let next = r.continue_stream(s).unwrap();
        assert_ne!(next, s);
        assert_eq!(r.active_stream(), Some(next));
        assert_eq!(r.ingest(s, ProtocolEvent::StreamEnd), Ingest::Discarded);

        r.ingest(next, start("a2"));
        r.ingest(next, text("a2", 0, "Sunny."));
        r.ingest(next, ProtocolEvent::StreamEnd);
        assert_eq!(r.state().message("a2").unwrap().text(), "Sunny.");
        assert_eq!(r.state().stream_status, StreamStatus::Idle);
    }

    #[test]
    fn test_continue_after_stream_ended() {
        let mut r = reconciler();
        let s = submitted(&mut r, "What's the weather in Lisbon?");
        r.ingest(s, start("a1"));
        r.ingest(
            s,
            tool("a1", "c1", "getWeatherInformation", ToolCallState::InputAvailable),
        );
        r.approve("c1").unwrap();
        // The old stream closes before the backend's reply arrives
        r.ingest(s, ProtocolEvent::StreamEnd);

        let next = r.continue_stream(s).unwrap();
        assert_eq!(r.state().stream_status, StreamStatus::Submitted);
        assert_eq!(r.ingest(next, start("a2")), Ingest::Applied);
    }

    #[test]
    fn test_no_continuation_after_stop_or_new_turn() {
        let mut r = reconciler();
        let s = submitted(&mut r, "Hi");
        r.stop();
        assert_eq!(r.continue_stream(s), None);
        assert_eq!(r.active_stream(), None);

        let s2 = submitted(&mut r, "Hi again");
        assert_eq!(r.continue_stream(s), None);
        assert_eq!(r.active_stream(), Some(s2));
    }

    #[test]
    fn test_events_notify_subscribers() {
        let mut r = reconciler();
        let mut rx = r.subscribe();
        gated(&mut r);

        let mut seen = vec![];
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ChatEvent::StatusChanged {
            from: StreamStatus::Idle,
            to: StreamStatus::Submitted,
        }));
        assert!(seen.contains(&ChatEvent::ConfirmationGate { pending: true }));
        assert!(seen.iter().any(|e| matches!(
            e,
            ChatEvent::ToolCallChanged { call_id, state: ToolCallState::InputAvailable, .. } if call_id == "c1"
        )));
        assert!(seen.last().is_some_and(ChatEvent::is_terminal));
    }
}
