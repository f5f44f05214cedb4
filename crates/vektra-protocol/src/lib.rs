//! vektra-protocol: message model and streaming protocol for vektra chat clients
//!
//! This crate defines the parts and messages a conversation is made of, the
//! events exchanged with the agent backend, and the merge rules that fold
//! streamed deltas into stable messages.

pub mod codec;
pub mod error;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{
    IncomingPart, MAX_PART_GAP, MergeOutcome, OutgoingEvent, ProtocolEvent, ProtocolEventStream,
    ToolCallUpdate, append_or_update_part,
};
pub use types::*;
