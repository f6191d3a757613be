//! Router error types.

use thiserror::Error;

use prepline_state::PoolType;

/// Why a request could not be placed. Never retried internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("function not found: {0}")]
    UnknownFunction(String),

    #[error("function {function_id} unavailable: {reason}")]
    FunctionUnavailable { function_id: String, reason: String },

    #[error("no capacity for function {function_id}")]
    NoCapacity { function_id: String },

    #[error("pool {pool} overloaded")]
    Overloaded { pool: PoolType },

    #[error("placement of {function_id} exceeded its deadline")]
    PlacementTimeout { function_id: String },

    #[error("node not found: {0}")]
    UnknownNode(String),

    /// A completion for which no placement holds a slot.
    #[error("no open placement of {function_id} on node {node_id}")]
    NoReservation { function_id: String, node_id: String },
}

impl RouterError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::UnknownFunction(_) | RouterError::FunctionUnavailable { .. } => {
                "FUNCTION_UNAVAILABLE"
            }
            RouterError::NoCapacity { .. } => "NO_CAPACITY",
            RouterError::Overloaded { .. } => "OVERLOADED",
            RouterError::PlacementTimeout { .. } => "PLACEMENT_TIMEOUT",
            RouterError::UnknownNode(_) => "NODE_NOT_FOUND",
            RouterError::NoReservation { .. } => "RESERVATION_NOT_FOUND",
        }
    }

    /// HTTP-equivalent status.
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::UnknownFunction(_) | RouterError::UnknownNode(_) => 404,
            RouterError::Overloaded { .. } => 429,
            RouterError::NoReservation { .. } => 409,
            RouterError::FunctionUnavailable { .. }
            | RouterError::NoCapacity { .. }
            | RouterError::PlacementTimeout { .. } => 503,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
