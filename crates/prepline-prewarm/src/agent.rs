//! Delivery of scale commands to nodes.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use prepline_state::ScaleCommand;

use crate::error::{PrewarmError, PrewarmResult};

pub type AgentFuture<'a> = Pin<Box<dyn Future<Output = PrewarmResult<()>> + Send + 'a>>;

/// Something that can carry a scale command to the node it names.
pub trait NodeAgent: Send + Sync {
    fn dispatch<'a>(&'a self, command: &'a ScaleCommand) -> AgentFuture<'a>;
}

/// Default agent: pushes commands onto a bounded stream that the daemon
/// fans out into per-node mailboxes.
#[derive(Debug, Clone)]
pub struct ChannelAgent {
    tx: mpsc::Sender<ScaleCommand>,
}

impl ChannelAgent {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScaleCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NodeAgent for ChannelAgent {
    fn dispatch<'a>(&'a self, command: &'a ScaleCommand) -> AgentFuture<'a> {
        Box::pin(async move {
            self.tx
                .send(command.clone())
                .await
                .map_err(|_| PrewarmError::AgentUnavailable(command.node_id.clone()))
        })
    }
}
