//! Error taxonomy shared by every meshreg tier.

use thiserror::Error;

use crate::types::NodeIdentity;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors surfaced by the lease, slot, heartbeat and push layers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The operation reached a meta replica that is not the leader.
    #[error("not leader (current leader: {})", leader.as_deref().unwrap_or("unknown"))]
    Leadership { leader: Option<String> },

    /// Renew or evict of a node that holds no lease.
    #[error("lease not found: {0}")]
    LeaseNotFound(NodeIdentity),

    /// Some data centers did not answer a fetch.
    #[error("partial data: missing data centers {missing:?}")]
    PartialData { missing: Vec<String> },

    /// A task ran out of retries.
    #[error("task {task} exhausted after {attempts} attempts")]
    TaskExhausted { task: String, attempts: u32 },

    /// Unknown node type or missing required field.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RegistryError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Leadership { .. }
                | RegistryError::Transport(_)
                | RegistryError::Storage(_)
                | RegistryError::LeaseNotFound(_)
        )
    }
}
