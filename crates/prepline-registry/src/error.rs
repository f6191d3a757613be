//! Registry error types.

use thiserror::Error;

/// Errors returned by node registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid node state for {node_id}: {reason}")]
    InvalidNodeState { node_id: String, reason: String },

    #[error("timed out acquiring node lock: {0}")]
    LockTimeout(String),

    #[error("node at its running limit: {0}")]
    NodeFull(String),

    #[error("node is unhealthy: {0}")]
    NodeUnavailable(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
