//! redb table definitions for the Prepline state store.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized records).
//! Keys are `{function_id}:{zero-padded ordinal}` so a function's records
//! are contiguous and sorted in insertion order.

use redb::TableDefinition;

pub const SAMPLES_TABLE: &str = "samples";
pub const DECISIONS_TABLE: &str = "decisions";

/// Hourly traffic samples keyed by `{function_id}:{timestamp_ms:020}`.
pub const SAMPLES: TableDefinition<&str, &[u8]> = TableDefinition::new(SAMPLES_TABLE);

/// Decision-log records keyed by `{function_id}:{seq:020}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new(DECISIONS_TABLE);
