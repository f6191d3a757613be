//! StateStore — redb-backed persistence for traffic history and decisions.
//!
//! Two tables: `samples` (hourly traffic buckets for the heatmap) and
//! `decisions` (the append-only routing and pre-warm log). Values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

fn txn_err(e: impl Display) -> StateError {
    StateError::Transaction(e.to_string())
}

fn table_err<E: Display>(table: &'static str) -> impl FnOnce(E) -> StateError {
    move |e| StateError::Table {
        table,
        reason: e.to_string(),
    }
}

fn encode<T: Serialize>(table: &'static str, function_id: &str, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Encode {
        table,
        function_id: function_id.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(table: &'static str, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        table,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

/// Upper bound (exclusive) of every key belonging to `function_id`.
///
/// Keys are `{function_id}:{digits}`; `;` sorts immediately after `:`.
fn prefix_end(function_id: &str) -> String {
    format!("{function_id};")
}

/// Split a composite key into its function id and zero-padded ordinal.
fn split_key(table: &'static str, key: &str) -> StateResult<(String, u64)> {
    let corrupt = |reason: &str| StateError::Corrupt {
        table,
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let (id, digits) = key.rsplit_once(':').ok_or_else(|| corrupt("missing ':' separator"))?;
    if digits.len() != 20 {
        return Err(corrupt("ordinal is not 20 digits"));
    }
    let ordinal = digits.parse().map_err(|_| corrupt("ordinal is not numeric"))?;
    Ok((id.to_string(), ordinal))
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open {
                path: ":memory:".to_string(),
                reason: e.to_string(),
            })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(txn_err)?;
        txn.open_table(SAMPLES).map_err(table_err(SAMPLES_TABLE))?;
        txn.open_table(DECISIONS).map_err(table_err(DECISIONS_TABLE))?;
        txn.commit().map_err(txn_err)?;
        Ok(())
    }

    fn put_encoded(&self, def: Table, name: &'static str, rows: Vec<(String, Vec<u8>)>) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(txn_err)?;
        {
            let mut table = txn.open_table(def).map_err(table_err(name))?;
            for (key, value) in &rows {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(table_err(name))?;
            }
        }
        txn.commit().map_err(txn_err)?;
        Ok(())
    }

    // ── Traffic samples ────────────────────────────────────────────

    /// Insert or overwrite a batch of samples in one transaction.
    pub fn put_samples(&self, samples: &[TrafficSample]) -> StateResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let rows = samples
            .iter()
            .map(|s| Ok((s.table_key(), encode(SAMPLES_TABLE, &s.function_id, s)?)))
            .collect::<StateResult<Vec<_>>>()?;
        self.put_encoded(SAMPLES, SAMPLES_TABLE, rows)?;
        debug!(count = samples.len(), "traffic samples stored");
        Ok(())
    }

    /// Samples for one function with `timestamp_ms >= since_ms`, oldest first.
    pub fn list_samples(
        &self,
        function_id: &str,
        since_ms: u64,
    ) -> StateResult<Vec<TrafficSample>> {
        let start = sample_key(function_id, since_ms);
        let end = prefix_end(function_id);
        let txn = self.db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(SAMPLES).map_err(table_err(SAMPLES_TABLE))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(table_err(SAMPLES_TABLE))?
        {
            let (key, value) = entry.map_err(table_err(SAMPLES_TABLE))?;
            let sample: TrafficSample = decode(SAMPLES_TABLE, key.value(), value.value())?;
            // Another function whose id extends this one shares the prefix.
            if sample.function_id == function_id {
                results.push(sample);
            }
        }
        Ok(results)
    }

    /// Every sample with `timestamp_ms >= since_ms`, across all functions.
    pub fn list_all_samples(&self, since_ms: u64) -> StateResult<Vec<TrafficSample>> {
        let txn = self.db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(SAMPLES).map_err(table_err(SAMPLES_TABLE))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(table_err(SAMPLES_TABLE))? {
            let (key, value) = entry.map_err(table_err(SAMPLES_TABLE))?;
            let (_, ts) = split_key(SAMPLES_TABLE, key.value())?;
            if ts >= since_ms {
                results.push(decode(SAMPLES_TABLE, key.value(), value.value())?);
            }
        }
        Ok(results)
    }

    /// Delete samples older than `before_ms`. Returns how many were removed.
    pub fn prune_samples(&self, before_ms: u64) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(txn_err)?;
        let removed;
        {
            let mut table = txn.open_table(SAMPLES).map_err(table_err(SAMPLES_TABLE))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(table_err(SAMPLES_TABLE))? {
                let (key, _) = entry.map_err(table_err(SAMPLES_TABLE))?;
                let (_, ts) = split_key(SAMPLES_TABLE, key.value())?;
                if ts < before_ms {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(table_err(SAMPLES_TABLE))?;
            }
            removed = stale.len();
        }
        txn.commit().map_err(txn_err)?;
        if removed > 0 {
            debug!(removed, before_ms, "pruned traffic samples");
        }
        Ok(removed)
    }

    // ── Decision log ───────────────────────────────────────────────

    /// Append a batch of log records in one transaction.
    pub fn put_log_records(&self, records: &[LogRecord]) -> StateResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records
            .iter()
            .map(|r| Ok((r.table_key(), encode(DECISIONS_TABLE, r.function_id(), r)?)))
            .collect::<StateResult<Vec<_>>>()?;
        self.put_encoded(DECISIONS, DECISIONS_TABLE, rows)
    }

    /// The newest `limit` records for a function, oldest first.
    pub fn list_log_records(&self, function_id: &str, limit: usize) -> StateResult<Vec<LogRecord>> {
        let start = format!("{function_id}:");
        let end = prefix_end(function_id);
        let txn = self.db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(DECISIONS).map_err(table_err(DECISIONS_TABLE))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(table_err(DECISIONS_TABLE))?
            .rev()
        {
            if results.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(table_err(DECISIONS_TABLE))?;
            let record: LogRecord = decode(DECISIONS_TABLE, key.value(), value.value())?;
            if record.function_id() == function_id {
                results.push(record);
            }
        }
        results.reverse();
        Ok(results)
    }

    /// Function ids that have at least one log record.
    pub fn log_function_ids(&self) -> StateResult<Vec<FunctionId>> {
        let txn = self.db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(DECISIONS).map_err(table_err(DECISIONS_TABLE))?;
        let mut ids: Vec<FunctionId> = Vec::new();
        for entry in table.iter().map_err(table_err(DECISIONS_TABLE))? {
            let (key, _) = entry.map_err(table_err(DECISIONS_TABLE))?;
            let (id, _) = split_key(DECISIONS_TABLE, key.value())?;
            if ids.last() != Some(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Highest sequence number ever persisted, or 0 for an empty log.
    pub fn max_log_seq(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(DECISIONS).map_err(table_err(DECISIONS_TABLE))?;
        let mut max = 0;
        for entry in table.iter().map_err(table_err(DECISIONS_TABLE))? {
            let (key, _) = entry.map_err(table_err(DECISIONS_TABLE))?;
            let (_, seq) = split_key(DECISIONS_TABLE, key.value())?;
            max = max.max(seq);
        }
        Ok(max)
    }

    /// Keep only the newest `keep` records for a function.
    pub fn prune_log(&self, function_id: &str, keep: usize) -> StateResult<usize> {
        let start = format!("{function_id}:");
        let end = prefix_end(function_id);
        let txn = self.db.begin_write().map_err(txn_err)?;
        let removed;
        {
            let mut table = txn.open_table(DECISIONS).map_err(table_err(DECISIONS_TABLE))?;
            let mut keys = Vec::new();
            for entry in table
                .range(start.as_str()..end.as_str())
                .map_err(table_err(DECISIONS_TABLE))?
            {
                let (key, _) = entry.map_err(table_err(DECISIONS_TABLE))?;
                let key = key.value();
                if split_key(DECISIONS_TABLE, key)?.0 == function_id {
                    keys.push(key.to_string());
                }
            }
            let excess = keys.len().saturating_sub(keep);
            for key in &keys[..excess] {
                table.remove(key.as_str()).map_err(table_err(DECISIONS_TABLE))?;
            }
            removed = excess;
        }
        txn.commit().map_err(txn_err)?;
        Ok(removed)
    }
}
