//! DecisionLog — the in-memory, per-function log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use prepline_core::config::DecisionsConfig;
use prepline_state::{
    DecisionLogEntry, FunctionId, LogRecord, RouterDecision, ScaleCommand, ScaleOutcome,
    ScaleRecord, StateResult, StateStore,
};

use crate::persister::DecisionPersister;

#[derive(Debug, Default)]
struct Shard {
    decisions: VecDeque<DecisionLogEntry>,
    scales: VecDeque<ScaleRecord>,
}

fn push_bounded<T>(deque: &mut VecDeque<T>, item: T, max: usize) {
    deque.push_back(item);
    while deque.len() > max {
        deque.pop_front();
    }
}

fn newest<T: Clone>(deque: &VecDeque<T>, limit: usize) -> Vec<T> {
    deque.iter().rev().take(limit).cloned().collect()
}

pub struct DecisionLog {
    shards: DashMap<FunctionId, Arc<Mutex<Shard>>>,
    seq: AtomicU64,
    max_entries: usize,
    decisions_total: AtomicU64,
    scales_total: AtomicU64,
    persist_tx: Option<mpsc::UnboundedSender<LogRecord>>,
}

impl DecisionLog {
    pub fn new(config: &DecisionsConfig) -> Self {
        Self {
            shards: DashMap::new(),
            seq: AtomicU64::new(0),
            max_entries: config.max_entries_per_function.max(1),
            decisions_total: AtomicU64::new(0),
            scales_total: AtomicU64::new(0),
            persist_tx: None,
        }
    }

    /// A log whose records are also written to `store` by the returned
    /// persister task.
    pub fn with_persistence(config: &DecisionsConfig, store: StateStore) -> (Self, DecisionPersister) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut log = Self::new(config);
        log.persist_tx = Some(tx);
        let persister = DecisionPersister::new(rx, store, log.max_entries);
        (log, persister)
    }

    fn shard(&self, function_id: &str) -> Arc<Mutex<Shard>> {
        if let Some(existing) = self.shards.get(function_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.shards
                .entry(function_id.to_string())
                .or_default()
                .value(),
        )
    }

    fn existing(&self, function_id: &str) -> Option<Arc<Mutex<Shard>>> {
        self.shards.get(function_id).map(|e| Arc::clone(e.value()))
    }

    fn forward(&self, record: LogRecord) {
        if let Some(tx) = &self.persist_tx {
            // A closed channel means the persister stopped at shutdown.
            let _ = tx.send(record);
        }
    }

    /// Append a placement. Sequence numbers are assigned under the shard
    /// lock, so each function's entries are in sequence order.
    pub fn append_decision(&self, decision: RouterDecision, current_warm: u32) -> DecisionLogEntry {
        let shard = self.shard(&decision.function_id);
        let entry = {
            let mut s = shard.lock();
            let entry = DecisionLogEntry {
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                decision,
                current_warm,
            };
            push_bounded(&mut s.decisions, entry.clone(), self.max_entries);
            entry
        };
        self.decisions_total.fetch_add(1, Ordering::Relaxed);
        self.forward(LogRecord::Decision(entry.clone()));
        entry
    }

    /// Append a pre-warm action.
    pub fn append_scale(&self, command: ScaleCommand, outcome: ScaleOutcome, issued_at_ms: u64) -> ScaleRecord {
        let shard = self.shard(&command.function_id);
        let record = {
            let mut s = shard.lock();
            let record = ScaleRecord {
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                command,
                outcome,
                issued_at_ms,
            };
            push_bounded(&mut s.scales, record.clone(), self.max_entries);
            record
        };
        self.scales_total.fetch_add(1, Ordering::Relaxed);
        self.forward(LogRecord::Scale(record.clone()));
        record
    }

    pub fn latest_decision(&self, function_id: &str) -> Option<DecisionLogEntry> {
        self.existing(function_id)
            .and_then(|shard| shard.lock().decisions.back().cloned())
    }

    /// Up to `limit` placements, newest first.
    pub fn decision_history(&self, function_id: &str, limit: usize) -> Vec<DecisionLogEntry> {
        self.existing(function_id)
            .map(|shard| newest(&shard.lock().decisions, limit))
            .unwrap_or_default()
    }

    /// Up to `limit` scale actions, newest first.
    pub fn scale_history(&self, function_id: &str, limit: usize) -> Vec<ScaleRecord> {
        self.existing(function_id)
            .map(|shard| newest(&shard.lock().scales, limit))
            .unwrap_or_default()
    }

    /// Highest sequence number assigned so far.
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Placements and scale actions appended since startup.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.decisions_total.load(Ordering::Relaxed),
            self.scales_total.load(Ordering::Relaxed),
        )
    }

    /// Rebuild shards from the store and continue numbering after the
    /// highest persisted sequence.
    pub fn reload(&self, store: &StateStore) -> StateResult<usize> {
        let mut loaded = 0;
        for function_id in store.log_function_ids()? {
            let records = store.list_log_records(&function_id, self.max_entries * 2)?;
            let shard = self.shard(&function_id);
            let mut s = shard.lock();
            for record in records {
                loaded += 1;
                match record {
                    LogRecord::Decision(entry) => push_bounded(&mut s.decisions, entry, self.max_entries),
                    LogRecord::Scale(scale) => push_bounded(&mut s.scales, scale, self.max_entries),
                }
            }
        }
        let max_seq = store.max_log_seq()?;
        self.seq.fetch_max(max_seq, Ordering::SeqCst);
        info!(records = loaded, last_seq = max_seq, "decision log reloaded");
        debug!(functions = self.shards.len(), "decision shards rebuilt");
        Ok(loaded)
    }
}
