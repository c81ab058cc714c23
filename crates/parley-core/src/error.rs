//! Error taxonomy for the messaging core.

use parley_protocol::{ErrorKind, Frame, MessageId};
use thiserror::Error;

/// Errors surfaced by messaging operations.
///
/// Every variant maps onto one [`ErrorKind`] that is reported back to the
/// connection or request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Missing, invalid or expired credential.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Missing or malformed field in a request.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No message with this id.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The message store failed. Never retried.
    #[error("Storage failure: {0}")]
    Persistence(String),
}

impl ChatError {
    /// Shorthand for a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        ChatError::Validation(reason.into())
    }

    /// Shorthand for a persistence error.
    pub fn persistence(reason: impl std::fmt::Display) -> Self {
        ChatError::Persistence(reason.to_string())
    }

    /// The wire-level category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Authentication(_) => ErrorKind::AuthenticationError,
            ChatError::Validation(_) => ErrorKind::ValidationError,
            ChatError::NotFound(_) => ErrorKind::NotFoundError,
            ChatError::Persistence(_) => ErrorKind::PersistenceError,
        }
    }

    /// Numeric error code.
    #[must_use]
    pub fn code(&self) -> u16 {
        self.kind().code()
    }

    /// Render as an error frame answering request `id`.
    #[must_use]
    pub fn to_frame(&self, id: u64) -> Frame {
        Frame::error(id, self.kind(), self.to_string())
    }
}

/// Result alias for messaging operations.
pub type ChatResult<T> = Result<T, ChatError>;
