//! Error types for vektra-protocol

use thiserror::Error;

/// Result type alias using vektra-protocol Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding, decoding or transporting protocol events
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line of an event script or SSE body could not be decoded
    #[error("Decode error on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The transport failed to deliver or open a stream
    #[error("Transport error: {0}")]
    Transport(String),

    /// The stream ended without `stream-end` or `stream-error`
    #[error("Stream closed before completion")]
    Closed,

    /// Request was cancelled before a stream was opened
    #[error("Request aborted")]
    Aborted,
}

impl Error {
    /// Create a transport error from a message
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Check if this error came from a local cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
