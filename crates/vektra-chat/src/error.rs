//! Error types for vektra-chat

use thiserror::Error;

/// Result type alias using vektra-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the command surface
#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input, such as an empty submission
    #[error("Validation error: {0}")]
    Validation(String),

    /// No tool call with this id exists in the conversation
    #[error("Tool call not found: {0}")]
    NotFound(String),

    /// The command does not apply in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The transport failed
    #[error(transparent)]
    Transport(#[from] vektra_protocol::Error),
}

impl Error {
    /// Check if this error is a caller mistake that left the state untouched
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::NotFound(_) | Error::InvalidState(_)
        )
    }

    /// Check if this error came from the transport
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
