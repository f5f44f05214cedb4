//! Command surface: drives a [`Reconciler`] over a [`Transport`]

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vektra_protocol::{OutgoingEvent, ProtocolEventStream};

use crate::{
    conversation::{AwaitingConfirmation, ConversationState},
    error::Result,
    events::ChatEvent,
    handle::SessionHandle,
    policy::{ConfirmationPolicy, DEFAULT_GATED_TOOL},
    reconciler::{Ingest, Reconciler, StreamId, Submission},
    transport::Transport,
};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tools whose calls wait for a human decision
    pub policy: ConfirmationPolicy,
    /// Let a backend tool manifest replace `policy`
    pub trust_advertised_tools: bool,
    /// Metadata attached to every user submission
    pub submit_metadata: serde_json::Value,
    /// Capacity of the change-notification channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ConfirmationPolicy::new([DEFAULT_GATED_TOOL]),
            trust_advertised_tools: true,
            submit_metadata: serde_json::json!({ "annotations": { "hello": "world" } }),
            event_capacity: 256,
        }
    }
}

/// A chat session.
///
/// Commands update state synchronously through the reconciler, then send the
/// resulting event. Response streams are pumped on background tasks.
pub struct ChatSession {
    reconciler: Arc<Mutex<Reconciler>>,
    transport: Arc<dyn Transport>,
    handle: SessionHandle,
    submit_metadata: serde_json::Value,
}

impl ChatSession {
    /// Create a new session
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let mut reconciler = Reconciler::with_capacity(config.policy, config.event_capacity);
        reconciler.set_trust_advertised(config.trust_advertised_tools);
        Self {
            reconciler: Arc::new(Mutex::new(reconciler)),
            transport,
            handle: SessionHandle::new(),
            submit_metadata: config.submit_metadata,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.reconciler.lock().subscribe()
    }

    /// Get a cloneable handle for cancelling and awaiting streams
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ConversationState {
        self.reconciler.lock().snapshot()
    }

    /// Gated tool calls waiting for a decision
    pub fn awaiting_confirmation(&self) -> Vec<AwaitingConfirmation> {
        self.reconciler.lock().awaiting_confirmation()
    }

    /// Policy currently in force
    pub fn policy(&self) -> ConfirmationPolicy {
        self.reconciler.lock().policy().clone()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.reconciler.lock().set_draft(text);
    }

    pub fn draft(&self) -> String {
        self.reconciler.lock().draft().to_string()
    }

    /// Submit a user message
    pub async fn submit_user_message(&self, text: &str) -> Result<StreamId> {
        let submission = self
            .reconciler
            .lock()
            .submit_user_message(text, self.submit_metadata.clone())?;
        self.dispatch(submission, true).await
    }

    /// Submit the draft buffer; the draft survives a rejected submission
    pub async fn submit_draft(&self) -> Result<StreamId> {
        let submission = self
            .reconciler
            .lock()
            .submit_draft(self.submit_metadata.clone())?;
        self.dispatch(submission, true).await
    }

    /// Record a tool result and send it to the backend.
    ///
    /// Returns the stream the backend's reply is read from. A result sent
    /// mid-stream that the backend answers with a new stream moves the turn
    /// onto it, and the old stream is abandoned.
    pub async fn supply_tool_result(
        &self,
        call_id: &str,
        output: serde_json::Value,
    ) -> Result<StreamId> {
        let (submission, opened) = {
            let mut reconciler = self.reconciler.lock();
            let was_active = reconciler.active_stream();
            let submission = reconciler.supply_tool_result(call_id, output)?;
            let opened = was_active != Some(submission.stream);
            (submission, opened)
        };
        self.dispatch(submission, opened).await
    }

    /// Approve a gated tool call
    pub async fn approve(&self, call_id: &str) -> Result<StreamId> {
        self.supply_tool_result(call_id, vektra_protocol::approval::YES.into())
            .await
    }

    /// Deny a gated tool call
    pub async fn deny(&self, call_id: &str) -> Result<StreamId> {
        self.supply_tool_result(call_id, vektra_protocol::approval::NO.into())
            .await
    }

    /// Stop the current stream. No-op when idle.
    pub async fn stop(&self) {
        let cancel = self.reconciler.lock().stop();
        self.handle.abort();
        if let Some(event) = cancel {
            self.send_cancel(event).await;
        }
    }

    /// Remove every message, cancelling any active stream
    pub async fn clear_history(&self) {
        let cancel = self.reconciler.lock().clear_history();
        self.handle.abort();
        if let Some(event) = cancel {
            self.send_cancel(event).await;
        }
    }

    /// Attach a stream the backend opened on its own
    pub fn accept_stream(&self, stream: ProtocolEventStream) -> Result<StreamId> {
        let id = self.reconciler.lock().accept_stream()?;
        let cancel = self.handle.renew();
        self.spawn_pump(id, stream, &cancel);
        Ok(id)
    }

    /// Wait until no response stream is being pumped
    pub async fn wait_for_idle(&self) {
        self.handle.wait_for_idle().await;
    }

    async fn dispatch(&self, submission: Submission, opened: bool) -> Result<StreamId> {
        let Submission { stream: id, event } = submission;
        let cancel = if opened {
            self.handle.renew()
        } else {
            self.handle.cancel_token()
        };

        match self.transport.send(event, cancel.clone()).await {
            Ok(Some(stream)) if opened => {
                self.spawn_pump(id, stream, &cancel);
                Ok(id)
            }
            Ok(Some(stream)) => {
                // The reply to a mid-stream result arrived as a stream of its own
                let next = {
                    let mut reconciler = self.reconciler.lock();
                    if cancel.is_cancelled() {
                        None
                    } else {
                        reconciler.continue_stream(id)
                    }
                };
                match next {
                    Some(next) => {
                        self.spawn_pump(next, stream, &cancel);
                        Ok(next)
                    }
                    None => {
                        tracing::debug!("Dropping reply to {}, the turn has moved on", id);
                        Ok(id)
                    }
                }
            }
            Ok(None) => Ok(id),
            Err(e) if e.is_cancellation() => {
                tracing::debug!("Send for {} aborted", id);
                Err(e.into())
            }
            Err(e) => {
                tracing::error!("Failed to send to backend: {}", e);
                self.reconciler.lock().fail(id, e.to_string());
                Err(e.into())
            }
        }
    }

    async fn send_cancel(&self, event: OutgoingEvent) {
        if let Err(e) = self
            .transport
            .send(event, CancellationToken::new())
            .await
        {
            tracing::warn!("Failed to send cancel: {}", e);
        }
    }

    fn spawn_pump(&self, id: StreamId, mut stream: ProtocolEventStream, parent: &CancellationToken) {
        let reconciler = Arc::clone(&self.reconciler);
        let handle = self.handle.clone();
        let cancel = handle.next_pump(parent);
        handle.pump_started();

        tokio::spawn(async move {
            let mut closed = false;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => event,
                };
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                if reconciler.lock().ingest(id, event) == Ingest::Discarded {
                    tracing::debug!("{} is no longer active, dropping its stream", id);
                    closed = true;
                    break;
                }
                if terminal {
                    closed = true;
                    break;
                }
            }

            if !closed && !cancel.is_cancelled() {
                let reason = vektra_protocol::Error::Closed.to_string();
                reconciler.lock().fail(id, reason);
            }
            handle.pump_finished();
        });
    }
}
