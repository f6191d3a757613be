//! Router — admits, arbitrates, and commits placements.
//!
//! Placement runs synchronously on the caller's task. Every node lock it
//! takes, for pool listings as well as the reservation itself, is bounded
//! by one `placement_timeout` deadline; missing it commits nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use prepline_core::SharedClock;
use prepline_core::config::RouterConfig;
use prepline_decisions::DecisionLog;
use prepline_registry::{NodeRegistry, PoolLoad, RegistryError, Reservation};
use prepline_sizer::WarmPoolSizer;
use prepline_state::{
    ExecutionMode, FunctionDirectory, FunctionId, FunctionProfile, NodeId, NodeSnapshot, PoolType, Priority,
    RouterDecision, new_run_id,
};
use prepline_traffic::{TrafficObserver, TrafficRecorder};

use crate::error::{RouterError, RouterResult};
use crate::queue::{AdmissionQueue, QueueTicket, QueuedRequest};

/// Collaborators the router reads from and writes to.
#[derive(Clone)]
pub struct RouterDeps {
    pub directory: Arc<dyn FunctionDirectory>,
    pub registry: Arc<NodeRegistry>,
    pub observer: Arc<TrafficObserver>,
    pub recorder: TrafficRecorder,
    pub sizer: Arc<WarmPoolSizer>,
    pub log: Arc<DecisionLog>,
}

/// One invocation asking for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub function_id: FunctionId,
    /// Falls back to the function's default priority.
    pub priority: Option<Priority>,
}

impl PlacementRequest {
    pub fn new(function_id: impl Into<FunctionId>) -> Self {
        Self {
            function_id: function_id.into(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A committed placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub decision: RouterDecision,
    pub mode: ExecutionMode,
}

/// Result of a synchronous placement attempt.
#[derive(Debug)]
pub enum PlaceOutcome {
    Placed(Placement),
    /// The pool is saturated; the ticket resolves once a slot frees up.
    Queued(QueueTicket),
}

/// Counters exported on `/metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterStats {
    pub placements_total: u64,
    pub warm_total: u64,
    pub cold_total: u64,
    pub queued_total: u64,
    pub rejected_total: u64,
    pub timeouts_total: u64,
    pub in_flight: u32,
    pub queue_depths: Vec<(PoolType, usize)>,
}

#[derive(Debug, Default)]
struct Counters {
    placements: AtomicU64,
    warm: AtomicU64,
    cold: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
}

pub struct Router {
    deps: RouterDeps,
    config: RouterConfig,
    clock: SharedClock,
    queues: [AdmissionQueue; PoolType::ALL.len()],
    arrivals: AtomicU64,
    counters: Counters,
    /// Placed invocations not yet completed, per node and function.
    in_flight: DashMap<(NodeId, FunctionId), u32>,
}

impl Router {
    pub fn new(deps: RouterDeps, config: RouterConfig, clock: SharedClock) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            deps,
            queues: std::array::from_fn(|_| AdmissionQueue::new(capacity)),
            config,
            clock,
            arrivals: AtomicU64::new(0),
            counters: Counters::default(),
            in_flight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn deps(&self) -> &RouterDeps {
        &self.deps
    }

    fn queue(&self, pool: PoolType) -> &AdmissionQueue {
        &self.queues[pool.index()]
    }

    /// Try to place a request right now.
    ///
    /// Returns `Queued` when the chosen pool is saturated and the request is
    /// not CRITICAL. Errors are final; nothing is retried internally.
    pub fn place(&self, request: PlacementRequest) -> RouterResult<PlaceOutcome> {
        let result = self.place_inner(request);
        if let Err(e) = &result {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(code = e.code(), error = %e, "placement rejected");
        }
        result
    }

    fn place_inner(&self, request: PlacementRequest) -> RouterResult<PlaceOutcome> {
        let profile = self.admit(&request.function_id)?;
        let priority = request.priority.unwrap_or(profile.default_priority);
        let deadline = Instant::now() + self.config.placement_timeout;

        let Some((pool, nodes)) = self.select_pool(&profile, deadline)? else {
            // Nowhere has room. A preferred pool that still has healthy
            // nodes is merely full, so ordinary requests may wait for it.
            let preferred = profile.pool_type;
            if priority != Priority::Critical {
                let load = self
                    .deps
                    .registry
                    .pool_load_until(preferred, deadline)
                    .map_err(|e| self.deadline_missed(&profile.function_id, e))?;
                if load.capacity > 0 {
                    return self.enqueue(profile, preferred, priority);
                }
            }
            return Err(RouterError::NoCapacity {
                function_id: profile.function_id,
            });
        };

        if priority != Priority::Critical {
            let saturation = PoolLoad::of(&nodes).saturation();
            if saturation >= self.config.saturation_threshold || !self.queue(pool).is_empty() {
                return self.enqueue(profile, pool, priority);
            }
        }

        self.commit(&profile, pool, priority, &nodes, deadline)
            .map(PlaceOutcome::Placed)
    }

    /// Map a registry failure met before a reservation into the placement's
    /// terminal error.
    fn deadline_missed(&self, function_id: &str, error: RegistryError) -> RouterError {
        match error {
            RegistryError::LockTimeout(node_id) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(%function_id, %node_id, "placement deadline exceeded");
                RouterError::PlacementTimeout {
                    function_id: function_id.to_string(),
                }
            }
            other => {
                debug!(%function_id, error = %other, "pool listing failed");
                RouterError::NoCapacity {
                    function_id: function_id.to_string(),
                }
            }
        }
    }

    /// Place, waiting in the admission queue up to `queue_wait` if needed.
    pub async fn submit(&self, request: PlacementRequest) -> RouterResult<Placement> {
        match self.place(request)? {
            PlaceOutcome::Placed(placement) => Ok(placement),
            PlaceOutcome::Queued(ticket) => {
                let result = ticket.wait(self.config.queue_wait).await;
                if result.is_err() {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
        }
    }

    fn admit(&self, function_id: &str) -> RouterResult<FunctionProfile> {
        let profile = self
            .deps
            .directory
            .get_function_profile(function_id)
            .ok_or_else(|| RouterError::UnknownFunction(function_id.to_string()))?;

        let stats = self.deps.observer.current_stats(function_id);
        if stats.requests >= self.config.min_requests_for_error_gate
            && stats.error_rate > self.config.fatal_error_rate
        {
            warn!(
                %function_id,
                error_rate = stats.error_rate,
                requests = stats.requests,
                "function refused by error gate"
            );
            return Err(RouterError::FunctionUnavailable {
                function_id: function_id.to_string(),
                reason: format!("error rate {:.2} above {:.2}", stats.error_rate, self.config.fatal_error_rate),
            });
        }
        Ok(profile)
    }

    /// First pool, preferred then fallbacks, with a node under its limit,
    /// together with that pool's placeable nodes.
    fn select_pool(
        &self,
        profile: &FunctionProfile,
        deadline: Instant,
    ) -> RouterResult<Option<(PoolType, Vec<NodeSnapshot>)>> {
        let preferred = profile.pool_type;
        let fallbacks = PoolType::ALL
            .into_iter()
            .filter(|&p| profile.fallback_eligible && p != preferred);
        for pool in std::iter::once(preferred).chain(fallbacks) {
            let nodes = self
                .deps
                .registry
                .list_healthy_nodes_until(pool, deadline)
                .map_err(|e| self.deadline_missed(&profile.function_id, e))?;
            if PoolLoad::of(&nodes).nodes_with_room > 0 {
                return Ok(Some((pool, nodes)));
            }
        }
        Ok(None)
    }

    /// Candidate nodes in preference order: warm holders first, then the
    /// rest, each group in capacity order.
    fn candidates(nodes: &[NodeSnapshot], function_id: &str) -> Vec<NodeSnapshot> {
        let (warm, cold): (Vec<_>, Vec<_>) = nodes
            .iter()
            .filter(|node| node.has_room())
            .cloned()
            .partition(|node| node.warm_for(function_id) > 0);
        warm.into_iter().chain(cold).collect()
    }

    /// Reserve a slot on the best candidate among `nodes`, a listing of
    /// `pool` taken under the same deadline.
    fn commit(
        &self,
        profile: &FunctionProfile,
        pool: PoolType,
        priority: Priority,
        nodes: &[NodeSnapshot],
        deadline: Instant,
    ) -> RouterResult<Placement> {
        let function_id = profile.function_id.as_str();
        let current_warm: u32 = nodes.iter().map(|node| node.warm_for(function_id)).sum();
        for node in Self::candidates(nodes, function_id) {
            match self.deps.registry.try_reserve(&node.node_id, function_id, deadline) {
                Ok(reservation) => {
                    return Ok(self.record(profile, pool, priority, reservation, current_warm));
                }
                Err(e @ RegistryError::LockTimeout(_)) => return Err(self.deadline_missed(function_id, e)),
                Err(e) => {
                    debug!(%function_id, node_id = %node.node_id, error = %e, "candidate skipped");
                }
            }
        }
        Err(RouterError::NoCapacity {
            function_id: function_id.to_string(),
        })
    }

    fn record(
        &self,
        profile: &FunctionProfile,
        pool: PoolType,
        priority: Priority,
        reservation: Reservation,
        current_warm: u32,
    ) -> Placement {
        let function_id = profile.function_id.as_str();
        *self
            .in_flight
            .entry((reservation.node_id.clone(), profile.function_id.clone()))
            .or_insert(0) += 1;
        let decision = RouterDecision {
            run_id: new_run_id(),
            function_id: profile.function_id.clone(),
            pool_type: pool,
            node_id: reservation.node_id,
            mode: reservation.mode,
            desired_warm: self.deps.sizer.desired_warm(function_id, pool),
            priority,
            stats: self.deps.observer.current_stats(function_id),
            decided_at_ms: self.clock.now_ms(),
        };
        let entry = self.deps.log.append_decision(decision, current_warm);

        self.counters.placements.fetch_add(1, Ordering::Relaxed);
        match reservation.mode {
            ExecutionMode::Warm => self.counters.warm.fetch_add(1, Ordering::Relaxed),
            ExecutionMode::Cold => self.counters.cold.fetch_add(1, Ordering::Relaxed),
        };
        info!(
            %function_id,
            node = %entry.decision.node_id,
            %pool,
            mode = %reservation.mode,
            %priority,
            seq = entry.seq,
            "placed"
        );
        Placement {
            decision: entry.decision,
            mode: reservation.mode,
        }
    }

    fn enqueue(&self, profile: FunctionProfile, pool: PoolType, priority: Priority) -> RouterResult<PlaceOutcome> {
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest {
            priority,
            order: self.arrivals.fetch_add(1, Ordering::Relaxed),
            profile,
            enqueued_at: Instant::now(),
            reply: tx,
        };
        if let Err(rejected) = self.queue(pool).push(request) {
            warn!(function_id = %rejected.profile.function_id, %pool, "admission queue full");
            return Err(RouterError::Overloaded { pool });
        }
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        debug!(%pool, %priority, depth = self.queue(pool).len(), "request queued");

        // A queue that was non-empty while the pool had headroom drains now.
        self.pump(pool);
        Ok(PlaceOutcome::Queued(QueueTicket::new(pool, priority, rx)))
    }

    /// Admit queued requests for `pool` in priority order while it stays
    /// below the saturation threshold. Returns how many were placed.
    pub fn pump(&self, pool: PoolType) -> usize {
        let queue = self.queue(pool);
        let mut admitted = 0;
        while !queue.is_empty() {
            let deadline = Instant::now() + self.config.placement_timeout;
            let nodes = match self.deps.registry.list_healthy_nodes_until(pool, deadline) {
                Ok(nodes) => nodes,
                Err(e) => {
                    debug!(%pool, error = %e, "pump deferred");
                    break;
                }
            };
            if PoolLoad::of(&nodes).saturation() >= self.config.saturation_threshold {
                break;
            }
            let Some(request) = queue.pop() else { break };
            if request.reply.is_closed() {
                continue;
            }
            match self.commit(&request.profile, pool, request.priority, &nodes, deadline) {
                Ok(placement) => {
                    let node_id = placement.decision.node_id.clone();
                    if request.reply.send(Ok(placement)).is_err() {
                        // The waiter left between the check and the send.
                        self.settle(&node_id, &request.profile.function_id);
                        let _ = self.deps.registry.release(&node_id);
                        continue;
                    }
                    admitted += 1;
                }
                Err(e) => {
                    debug!(%pool, error = %e, "queued request not admitted yet");
                    queue.restore(request);
                    break;
                }
            }
        }
        if admitted > 0 {
            debug!(%pool, admitted, remaining = queue.len(), "admission queue pumped");
        }
        admitted
    }

    /// Close one open placement of `function_id` on `node_id`. False when
    /// none is open.
    fn settle(&self, node_id: &str, function_id: &str) -> bool {
        match self.in_flight.entry((node_id.to_string(), function_id.to_string())) {
            Entry::Occupied(mut open) => {
                *open.get_mut() -= 1;
                if *open.get() == 0 {
                    open.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Placements handed out and not yet completed.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.iter().map(|entry| *entry.value()).sum()
    }

    /// An invocation finished: free its slot, feed the observer, and let
    /// queued work into the node's pool.
    ///
    /// Only completions matching an open placement are accepted, so traffic
    /// state is never created for functions nobody placed.
    pub fn complete(&self, function_id: &str, node_id: &str, duration_ms: f64, success: bool) -> RouterResult<()> {
        let node = self.deps.registry.snapshot(node_id).map_err(|e| match e {
            RegistryError::NodeNotFound(id) => RouterError::UnknownNode(id),
            other => RouterError::UnknownNode(other.to_string()),
        })?;
        if self.deps.directory.get_function_profile(function_id).is_none() {
            return Err(RouterError::UnknownFunction(function_id.to_string()));
        }
        if !self.settle(node_id, function_id) {
            warn!(%function_id, %node_id, "completion without an open placement");
            return Err(RouterError::NoReservation {
                function_id: function_id.to_string(),
                node_id: node_id.to_string(),
            });
        }
        self.deps
            .registry
            .release(node_id)
            .map_err(|_| RouterError::UnknownNode(node_id.to_string()))?;
        self.deps
            .recorder
            .record_completion(function_id, duration_ms, success, self.clock.now_ms());
        debug!(%function_id, %node_id, duration_ms, success, "invocation completed");
        self.pump(node.pool_type);
        Ok(())
    }

    pub fn queue_depth(&self, pool: PoolType) -> usize {
        self.queue(pool).len()
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            placements_total: c.placements.load(Ordering::Relaxed),
            warm_total: c.warm.load(Ordering::Relaxed),
            cold_total: c.cold.load(Ordering::Relaxed),
            queued_total: c.queued.load(Ordering::Relaxed),
            rejected_total: c.rejected.load(Ordering::Relaxed),
            timeouts_total: c.timeouts.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            queue_depths: PoolType::ALL
                .into_iter()
                .map(|pool| (pool, self.queue_depth(pool)))
                .collect(),
        }
    }

    /// Expire stale waiters and pump every pool until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.pump_interval.as_millis() as u64,
            "queue pump started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.pump_interval) => {
                    for pool in PoolType::ALL {
                        let expired = self.queue(pool).expire(pool, self.config.queue_wait);
                        if expired > 0 {
                            warn!(%pool, expired, "queued requests expired");
                        }
                        self.pump(pool);
                    }
                }
                _ = shutdown.changed() => {
                    info!("queue pump shutting down");
                    break;
                }
            }
        }
    }
}
