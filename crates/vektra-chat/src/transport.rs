//! Transport abstraction for talking to an agent backend

use std::{collections::VecDeque, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use vektra_protocol::{Error, OutgoingEvent, ProtocolEvent, ProtocolEventStream, Result};

/// Carries outgoing events to the backend and hands back its responses
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an event.
    ///
    /// Events that open a stream (see [`OutgoingEvent::opens_stream`]) return
    /// the backend's response stream; [`OutgoingEvent::Cancel`] returns `None`.
    /// Implementations should stop yielding once `cancel` fires.
    async fn send(
        &self,
        event: OutgoingEvent,
        cancel: CancellationToken,
    ) -> Result<Option<ProtocolEventStream>>;
}

/// Replays canned responses, one per stream-opening event.
///
/// A response without a terminal event stays open until it is cancelled, the
/// way a live connection would.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Vec<ProtocolEvent>>>,
    sent: Mutex<Vec<OutgoingEvent>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    /// Create a transport that answers with `responses` in order
    pub fn new(responses: Vec<Vec<ProtocolEvent>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            sent: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Pause between yielded events
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of responses not yet consumed
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<OutgoingEvent> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        event: OutgoingEvent,
        cancel: CancellationToken,
    ) -> Result<Option<ProtocolEventStream>> {
        let opens_stream = event.opens_stream();
        tracing::debug!("Sending {:?}", event);
        self.sent.lock().push(event);
        if !opens_stream {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let events = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| Error::transport("no scripted response left"))?;
        let delay = self.delay;

        let stream: ProtocolEventStream = Box::pin(stream! {
            let mut closed = false;
            for event in events {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                closed = event.is_terminal();
                yield event;
                if closed {
                    break;
                }
            }
            if !closed {
                cancel.cancelled().await;
            }
        });

        Ok(Some(stream))
    }
}
