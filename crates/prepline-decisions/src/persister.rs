//! Background writer for the decision log.

use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use prepline_state::{FunctionId, LogRecord, StateStore};

/// Records written per transaction at most.
const MAX_BATCH: usize = 256;

/// Drains forwarded log records into the state store.
pub struct DecisionPersister {
    rx: mpsc::UnboundedReceiver<LogRecord>,
    store: StateStore,
    max_entries: usize,
}

impl DecisionPersister {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<LogRecord>, store: StateStore, max_entries: usize) -> Self {
        Self {
            rx,
            store,
            max_entries,
        }
    }

    /// Write one batch and trim the touched functions to twice the
    /// in-memory bound (placements and scale actions share the table).
    fn write(&self, batch: &[LogRecord]) {
        if let Err(e) = self.store.put_log_records(batch) {
            warn!(error = %e, records = batch.len(), "decision log write failed");
            return;
        }
        let touched: BTreeSet<FunctionId> = batch.iter().map(|r| r.function_id().to_string()).collect();
        for function_id in touched {
            if let Err(e) = self.store.prune_log(&function_id, self.max_entries * 2) {
                warn!(error = %e, %function_id, "decision log prune failed");
            }
        }
        debug!(records = batch.len(), "decision log batch persisted");
    }

    fn drain_ready(&mut self, batch: &mut Vec<LogRecord>) {
        while batch.len() < MAX_BATCH {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
    }

    /// Persist records until shutdown or until every sender is gone.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("decision persister started");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(record) => {
                        let mut batch = vec![record];
                        self.drain_ready(&mut batch);
                        self.write(&batch);
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    loop {
                        let mut batch = Vec::new();
                        self.drain_ready(&mut batch);
                        if batch.is_empty() {
                            break;
                        }
                        self.write(&batch);
                    }
                    break;
                }
            }
        }
        info!("decision persister stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use prepline_core::config::DecisionsConfig;
    use prepline_state::{ExecutionMode, FunctionStats, PoolType, Priority, RouterDecision};

    use crate::DecisionLog;

    use super::*;

    #[tokio::test]
    async fn appended_records_reach_the_store() {
        let store = StateStore::open_in_memory().unwrap();
        let config = DecisionsConfig {
            max_entries_per_function: 2,
        };
        let (log, persister) = DecisionLog::with_persistence(&config, store.clone());
        let log = Arc::new(log);
        let (tx, shutdown) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(persister.run(shutdown));

        for i in 0..6 {
            log.append_decision(
                RouterDecision {
                    run_id: format!("run-{i}"),
                    function_id: "f1".to_string(),
                    pool_type: PoolType::Cpu,
                    node_id: "n1".to_string(),
                    mode: ExecutionMode::Warm,
                    desired_warm: 1,
                    priority: Priority::High,
                    stats: FunctionStats::default(),
                    decided_at_ms: i,
                },
                1,
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let stored = store.list_log_records("f1", 100).unwrap();
        let seqs: Vec<u64> = stored.iter().map(LogRecord::seq).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
        assert_eq!(store.max_log_seq().unwrap(), 6);
    }
}
