//! vektra-chat: Turn reconciliation with human-in-the-loop tool gating
//!
//! This crate folds a backend's streamed events into conversation state,
//! holds gated tool calls until a human approves or denies them, and exposes
//! the commands a chat front end issues.

pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod policy;
pub mod reconciler;
pub mod session;
pub mod transport;

pub use conversation::{
    AwaitingConfirmation, ConversationState, StreamStatus, awaiting_confirmation,
    pending_confirmation,
};
pub use error::{Error, Result};
pub use events::ChatEvent;
pub use handle::SessionHandle;
pub use policy::{ConfirmationPolicy, DEFAULT_GATED_TOOL, PolicyDrift};
pub use reconciler::{CANCELLED_REASON, Ingest, Reconciler, StreamId, Submission};
pub use session::{ChatSession, SessionConfig};
pub use transport::{ScriptedTransport, Transport};
