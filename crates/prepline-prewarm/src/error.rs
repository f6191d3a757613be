//! Pre-warm scheduler error types.

use thiserror::Error;

use prepline_registry::RegistryError;

#[derive(Debug, Error)]
pub enum PrewarmError {
    #[error("agent for node {0} is not accepting commands")]
    AgentUnavailable(String),

    #[error("command to node {node_id} timed out")]
    CommandTimeout { node_id: String },

    #[error("node {node_id} rejected command: {reason}")]
    Rejected { node_id: String, reason: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type PrewarmResult<T> = Result<T, PrewarmError>;
