//! Errors raised by the redb-backed history and decision-log store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("storage transaction failed: {0}")]
    Transaction(String),

    /// A read or write against one of the two tables failed.
    #[error("{table} table: {reason}")]
    Table { table: &'static str, reason: String },

    #[error("cannot encode {table} record for function {function_id}: {reason}")]
    Encode {
        table: &'static str,
        function_id: String,
        reason: String,
    },

    /// A stored key or value no longer matches the layout this build writes.
    #[error("corrupt {table} entry {key}: {reason}")]
    Corrupt {
        table: &'static str,
        key: String,
        reason: String,
    },
}
