//! Session tier error types.

use thiserror::Error;

use meshreg_core::RegistryError;

/// Errors raised by the session-side membership cache and push pipeline.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The meta tier answered with a failed envelope.
    #[error("meta rejected request: {0}")]
    Rejected(String),

    #[error("push queue full, task dropped")]
    QueueFull,

    #[error("push queue closed")]
    QueueClosed,
}

impl SessionError {
    /// Whether the failed task may be scheduled again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Registry(e) => e.is_retryable(),
            SessionError::QueueFull => true,
            SessionError::Rejected(_) | SessionError::QueueClosed => false,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
