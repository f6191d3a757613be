//! Per-pool priority admission queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use prepline_state::{FunctionProfile, PoolType, Priority};

use crate::error::{RouterError, RouterResult};
use crate::router::Placement;

/// A request waiting for its pool to drop below saturation.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub priority: Priority,
    /// Arrival order; earlier arrivals win within a priority class.
    pub order: u64,
    pub profile: FunctionProfile,
    pub enqueued_at: Instant,
    pub reply: oneshot::Sender<RouterResult<Placement>>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Max-heap: highest priority first, then lowest arrival order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Bounded queue for one pool.
#[derive(Debug)]
pub(crate) struct AdmissionQueue {
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
        }
    }

    /// Enqueue, or hand the request back when the queue is full.
    pub fn push(&self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.capacity {
            return Err(request);
        }
        heap.push(request);
        Ok(())
    }

    /// Put back a request that could not be admitted after all.
    ///
    /// Ignores the capacity bound: the request already held a slot.
    pub fn restore(&self, request: QueuedRequest) {
        self.heap.lock().push(request);
    }

    pub fn pop(&self) -> Option<QueuedRequest> {
        self.heap.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Drop waiters that gave up and answer those past `max_wait` with
    /// `Overloaded`. Returns how many were removed.
    pub fn expire(&self, pool: PoolType, max_wait: Duration) -> usize {
        let mut heap = self.heap.lock();
        let before = heap.len();
        let (keep, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut *heap)
            .into_vec()
            .into_iter()
            .partition(|r| !r.reply.is_closed() && r.enqueued_at.elapsed() < max_wait);
        *heap = keep.into_iter().collect();
        let removed = before - heap.len();
        drop(heap);
        for request in expired {
            let _ = request.reply.send(Err(RouterError::Overloaded { pool }));
        }
        removed
    }
}

/// Handle to a queued placement.
#[derive(Debug)]
pub struct QueueTicket {
    pub pool: PoolType,
    pub priority: Priority,
    rx: oneshot::Receiver<RouterResult<Placement>>,
}

impl QueueTicket {
    pub(crate) fn new(pool: PoolType, priority: Priority, rx: oneshot::Receiver<RouterResult<Placement>>) -> Self {
        Self { pool, priority, rx }
    }

    /// Wait for admission; `Overloaded` once `max_wait` elapses.
    pub async fn wait(self, max_wait: Duration) -> RouterResult<Placement> {
        let pool = self.pool;
        match tokio::time::timeout(max_wait, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(RouterError::Overloaded { pool }),
        }
    }

    /// The outcome, if the request has already been admitted or rejected.
    pub fn try_result(&mut self) -> Option<RouterResult<Placement>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(RouterError::Overloaded { pool: self.pool }))
            }
        }
    }
}
