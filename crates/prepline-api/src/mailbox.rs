//! Per-node mailboxes for outbound scale commands.
//!
//! Nodes poll `GET /api/v1/nodes/{id}/commands`; the fan-out task files
//! every command from the scheduler's stream under its target node.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use prepline_state::{NodeId, ScaleCommand};

pub struct NodeMailboxes {
    boxes: DashMap<NodeId, Arc<Mutex<VecDeque<ScaleCommand>>>>,
    capacity: usize,
}

impl NodeMailboxes {
    /// Mailboxes holding at most `capacity` undelivered commands per node.
    pub fn new(capacity: usize) -> Self {
        Self {
            boxes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// File a command; the oldest one is dropped when the box is full.
    pub fn push(&self, command: ScaleCommand) {
        let mailbox = Arc::clone(self.boxes.entry(command.node_id.clone()).or_default().value());
        let mut queue = mailbox.lock();
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    node_id = %dropped.node_id,
                    function_id = %dropped.function_id,
                    "mailbox full, oldest command dropped"
                );
            }
        }
        queue.push_back(command);
    }

    /// Take every pending command for a node, oldest first.
    pub fn drain(&self, node_id: &str) -> Vec<ScaleCommand> {
        self.boxes
            .get(node_id)
            .map(|m| m.lock().drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, node_id: &str) -> usize {
        self.boxes.get(node_id).map(|m| m.lock().len()).unwrap_or(0)
    }

    /// Fan the command stream out until shutdown or until the stream ends.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<ScaleCommand>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!("node mailbox fan-out started");
        loop {
            tokio::select! {
                maybe = commands.recv() => match maybe {
                    Some(command) => {
                        debug!(node_id = %command.node_id, action = ?command.action, "command filed");
                        self.push(command);
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("node mailbox fan-out stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepline_state::{PoolType, ScaleAction};

    fn command(node_id: &str, function_id: &str) -> ScaleCommand {
        ScaleCommand {
            node_id: node_id.into(),
            function_id: function_id.into(),
            pool_type: PoolType::Cpu,
            action: ScaleAction::ScaleUp,
            delta: 1,
        }
    }

    #[test]
    fn drain_empties_one_node_only() {
        let boxes = NodeMailboxes::new(8);
        boxes.push(command("n1", "a"));
        boxes.push(command("n1", "b"));
        boxes.push(command("n2", "c"));

        let drained: Vec<String> = boxes.drain("n1").into_iter().map(|c| c.function_id).collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(boxes.drain("n1").is_empty());
        assert_eq!(boxes.pending("n2"), 1);
        assert!(boxes.drain("unknown").is_empty());
    }

    #[test]
    fn full_mailbox_drops_oldest() {
        let boxes = NodeMailboxes::new(2);
        for f in ["a", "b", "c"] {
            boxes.push(command("n1", f));
        }
        let drained: Vec<String> = boxes.drain("n1").into_iter().map(|c| c.function_id).collect();
        assert_eq!(drained, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn fan_out_files_streamed_commands() {
        let boxes = Arc::new(NodeMailboxes::new(8));
        let (tx, rx) = mpsc::channel(4);
        let (_stop, shutdown) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(Arc::clone(&boxes).run(rx, shutdown));

        tx.send(command("n7", "f")).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(boxes.pending("n7"), 1);
    }
}
