//! Non-blocking completion recording.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use prepline_state::FunctionId;

/// One finished invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub function_id: FunctionId,
    pub latency_ms: f64,
    pub success: bool,
    pub timestamp_ms: u64,
}

/// Cloneable handle that feeds the observer's ingest loop.
#[derive(Debug, Clone)]
pub struct TrafficRecorder {
    tx: mpsc::Sender<CompletionEvent>,
    dropped: Arc<AtomicU64>,
}

/// Create a recorder and the receiver the observer drains.
pub fn recorder_channel(capacity: usize) -> (TrafficRecorder, mpsc::Receiver<CompletionEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let recorder = TrafficRecorder {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (recorder, rx)
}

impl TrafficRecorder {
    /// Queue a completion. Never blocks; drops the event when the channel
    /// is full or the observer has stopped.
    pub fn record_completion(&self, function_id: &str, latency_ms: f64, success: bool, timestamp_ms: u64) {
        self.record(CompletionEvent {
            function_id: function_id.to_string(),
            latency_ms,
            success,
            timestamp_ms,
        });
    }

    pub fn record(&self, event: CompletionEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "channel full",
                mpsc::error::TrySendError::Closed(_) => "observer stopped",
            };
            warn!(dropped, reason, "completion event dropped");
        }
    }

    /// Events dropped since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let (recorder, mut rx) = recorder_channel(2);
        for i in 0..5 {
            recorder.record_completion("f1", 10.0, true, i);
        }
        assert_eq!(recorder.dropped_count(), 3);
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 0);
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 1);
    }

    #[tokio::test]
    async fn closed_channel_counts_as_dropped() {
        let (recorder, rx) = recorder_channel(4);
        drop(rx);
        recorder.record_completion("f1", 10.0, false, 0);
        assert_eq!(recorder.dropped_count(), 1);
    }
}
