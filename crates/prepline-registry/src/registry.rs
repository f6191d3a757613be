//! NodeRegistry — concurrent per-node records.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use prepline_core::SharedClock;
use prepline_core::config::RegistryConfig;
use prepline_state::{
    ExecutionMode, FunctionId, Heartbeat, NodeId, NodeSnapshot, NodeSpec, NodeStatus, PoolType,
    WarmEntry,
};

use crate::error::{RegistryError, RegistryResult};

/// Mutable state of one node, guarded by its own lock.
#[derive(Debug)]
struct NodeRecord {
    pool_type: PoolType,
    free_cpu_percent: f64,
    free_mem_gib: f64,
    warm: BTreeMap<FunctionId, WarmEntry>,
    running: u32,
    max_running: u32,
    last_heartbeat_ms: u64,
    /// Set by repeated command failures, cleared by the next heartbeat.
    quarantined: bool,
}

impl NodeRecord {
    fn current_warm(&self) -> u32 {
        self.warm.values().map(|e| e.count).sum()
    }

    fn status(&self, now_ms: u64, config: &RegistryConfig) -> NodeStatus {
        let age = now_ms.saturating_sub(self.last_heartbeat_ms);
        if self.quarantined || age > config.heartbeat_timeout.as_millis() as u64 {
            return NodeStatus::Unhealthy;
        }
        let busy_at = config.busy_ratio * f64::from(self.max_running);
        if f64::from(self.running) >= busy_at || self.free_cpu_percent < config.busy_cpu_floor {
            NodeStatus::Busy
        } else {
            NodeStatus::Healthy
        }
    }

    fn snapshot(&self, node_id: &str, now_ms: u64, config: &RegistryConfig) -> NodeSnapshot {
        NodeSnapshot {
            node_id: node_id.to_string(),
            pool_type: self.pool_type,
            free_cpu_percent: self.free_cpu_percent,
            free_mem_gib: self.free_mem_gib,
            current_warm: self.current_warm(),
            warm: self.warm.clone(),
            running_functions_count: self.running,
            max_running: self.max_running,
            status: self.status(now_ms, config),
            last_heartbeat_ms: self.last_heartbeat_ms,
        }
    }
}

/// A slot taken on a node by [`NodeRegistry::try_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub node_id: NodeId,
    /// Warm when the node held a warm container for the function.
    pub mode: ExecutionMode,
    /// Running count after the reservation.
    pub running: u32,
}

/// Aggregate load of the placeable nodes in one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolLoad {
    pub running: u32,
    pub capacity: u32,
    pub nodes_with_room: usize,
}

impl PoolLoad {
    /// Load over a listing from [`NodeRegistry::list_healthy_nodes_until`].
    pub fn of(nodes: &[NodeSnapshot]) -> Self {
        nodes.iter().fold(Self::default(), |mut load, node| {
            load.running += node.running_functions_count;
            load.capacity += node.max_running;
            if node.has_room() {
                load.nodes_with_room += 1;
            }
            load
        })
    }

    /// Running / capacity; a pool without capacity reads as fully saturated.
    pub fn saturation(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            f64::from(self.running) / f64::from(self.capacity)
        }
    }
}

/// Ordering used everywhere nodes are ranked: free CPU desc, free memory
/// desc, node id asc.
pub fn capacity_order(a: &NodeSnapshot, b: &NodeSnapshot) -> Ordering {
    b.free_cpu_percent
        .total_cmp(&a.free_cpu_percent)
        .then_with(|| b.free_mem_gib.total_cmp(&a.free_mem_gib))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

fn invalid(node_id: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidNodeState {
        node_id: node_id.to_string(),
        reason: reason.into(),
    }
}

fn validate_resources(node_id: &str, free_cpu_percent: f64, free_mem_gib: f64) -> RegistryResult<()> {
    if !free_cpu_percent.is_finite() || !(0.0..=100.0).contains(&free_cpu_percent) {
        return Err(invalid(node_id, format!("free_cpu_percent {free_cpu_percent} outside 0..=100")));
    }
    if !free_mem_gib.is_finite() || free_mem_gib < 0.0 {
        return Err(invalid(node_id, format!("free_mem_gib {free_mem_gib} is negative")));
    }
    Ok(())
}

/// Thread-safe registry of worker nodes.
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Arc<Mutex<NodeRecord>>>,
    config: RegistryConfig,
    clock: SharedClock,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig, clock: SharedClock) -> Self {
        Self {
            nodes: DashMap::new(),
            config,
            clock,
        }
    }

    fn record(&self, node_id: &str) -> RegistryResult<Arc<Mutex<NodeRecord>>> {
        self.nodes
            .get(node_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
    }

    /// Every record, cloned out of the map so no shard lock is held while
    /// node locks are taken.
    fn records(&self) -> Vec<(NodeId, Arc<Mutex<NodeRecord>>)> {
        self.nodes
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Add a node, or replace the static attributes of a known one.
    ///
    /// A re-registration keeps the node's warm inventory and running count.
    pub fn register(&self, spec: NodeSpec) -> RegistryResult<NodeSnapshot> {
        if spec.node_id.trim().is_empty() {
            return Err(invalid(&spec.node_id, "empty node id"));
        }
        validate_resources(&spec.node_id, spec.free_cpu_percent, spec.free_mem_gib)?;
        if spec.max_running == 0 {
            return Err(invalid(&spec.node_id, "max_running must be at least 1"));
        }

        let now = self.clock.now_ms();
        let record = match self.nodes.get(&spec.node_id).map(|e| Arc::clone(e.value())) {
            Some(existing) => {
                let mut rec = existing.lock();
                rec.pool_type = spec.pool_type;
                rec.free_cpu_percent = spec.free_cpu_percent;
                rec.free_mem_gib = spec.free_mem_gib;
                rec.max_running = spec.max_running;
                rec.last_heartbeat_ms = now;
                drop(rec);
                existing
            }
            None => {
                let record = Arc::new(Mutex::new(NodeRecord {
                    pool_type: spec.pool_type,
                    free_cpu_percent: spec.free_cpu_percent,
                    free_mem_gib: spec.free_mem_gib,
                    warm: BTreeMap::new(),
                    running: 0,
                    max_running: spec.max_running,
                    last_heartbeat_ms: now,
                    quarantined: false,
                }));
                Arc::clone(
                    self.nodes
                        .entry(spec.node_id.clone())
                        .or_insert(record)
                        .value(),
                )
            }
        };

        info!(
            node_id = %spec.node_id,
            pool = %spec.pool_type,
            max_running = spec.max_running,
            "node registered"
        );
        let snapshot = record.lock().snapshot(&spec.node_id, now, &self.config);
        Ok(snapshot)
    }

    /// Apply a heartbeat. Identical heartbeats at the same instant produce
    /// identical snapshots.
    pub fn heartbeat(&self, node_id: &str, hb: &Heartbeat) -> RegistryResult<NodeSnapshot> {
        validate_resources(node_id, hb.free_cpu_percent, hb.free_mem_gib)?;
        let record = self.record(node_id)?;
        let now = self.clock.now_ms();
        let mut rec = record.lock();

        rec.free_cpu_percent = hb.free_cpu_percent;
        rec.free_mem_gib = hb.free_mem_gib;
        rec.running = hb.running_functions_count;
        rec.last_heartbeat_ms = now;
        if rec.quarantined {
            info!(%node_id, "node heartbeat clears quarantine");
            rec.quarantined = false;
        }

        let previous = std::mem::take(&mut rec.warm);
        for (function_id, &count) in &hb.warm {
            if count == 0 {
                continue;
            }
            let last_used_ms = previous
                .get(function_id)
                .map(|e| e.last_used_ms)
                .unwrap_or(now);
            rec.warm.insert(function_id.clone(), WarmEntry { count, last_used_ms });
        }

        debug!(
            %node_id,
            running = rec.running,
            current_warm = rec.current_warm(),
            "heartbeat"
        );
        Ok(rec.snapshot(node_id, now, &self.config))
    }

    /// Remove a node entirely.
    pub fn deregister(&self, node_id: &str) -> RegistryResult<()> {
        self.nodes
            .remove(node_id)
            .map(|_| info!(%node_id, "node deregistered"))
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))
    }

    pub fn snapshot(&self, node_id: &str) -> RegistryResult<NodeSnapshot> {
        let record = self.record(node_id)?;
        let now = self.clock.now_ms();
        let snapshot = record.lock().snapshot(node_id, now, &self.config);
        Ok(snapshot)
    }

    /// All nodes, any status, ordered by id.
    pub fn list_nodes(&self) -> Vec<NodeSnapshot> {
        let now = self.clock.now_ms();
        let mut nodes: Vec<NodeSnapshot> = self
            .records()
            .into_iter()
            .map(|(id, record)| record.lock().snapshot(&id, now, &self.config))
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    fn placeable(&self, node_id: &str, rec: &NodeRecord, pool: PoolType, now_ms: u64) -> Option<NodeSnapshot> {
        if rec.pool_type != pool {
            return None;
        }
        let snap = rec.snapshot(node_id, now_ms, &self.config);
        (snap.status != NodeStatus::Unhealthy).then_some(snap)
    }

    /// Placeable nodes of a pool, best capacity first.
    pub fn list_healthy_nodes(&self, pool: PoolType) -> Vec<NodeSnapshot> {
        let now = self.clock.now_ms();
        let mut nodes: Vec<NodeSnapshot> = self
            .records()
            .into_iter()
            .filter_map(|(id, record)| self.placeable(&id, &record.lock(), pool, now))
            .collect();
        nodes.sort_by(capacity_order);
        nodes
    }

    /// Like [`list_healthy_nodes`](Self::list_healthy_nodes), but gives up
    /// with `LockTimeout` once `deadline` passes on any node lock.
    pub fn list_healthy_nodes_until(&self, pool: PoolType, deadline: Instant) -> RegistryResult<Vec<NodeSnapshot>> {
        let now = self.clock.now_ms();
        let mut nodes = Vec::new();
        for (id, record) in self.records() {
            let rec = record
                .try_lock_until(deadline)
                .ok_or_else(|| RegistryError::LockTimeout(id.clone()))?;
            nodes.extend(self.placeable(&id, &rec, pool, now));
        }
        nodes.sort_by(capacity_order);
        Ok(nodes)
    }

    /// Running vs. capacity over the placeable nodes of a pool, bounded by
    /// `deadline`.
    pub fn pool_load_until(&self, pool: PoolType, deadline: Instant) -> RegistryResult<PoolLoad> {
        Ok(PoolLoad::of(&self.list_healthy_nodes_until(pool, deadline)?))
    }

    /// Adjust a node's warm count for one function, clamping at zero.
    ///
    /// Returns the function's new warm count on that node.
    pub fn apply_warm_delta(&self, node_id: &str, function_id: &str, delta: i64) -> RegistryResult<u32> {
        let record = self.record(node_id)?;
        let now = self.clock.now_ms();
        let mut rec = record.lock();

        let current = rec.warm.get(function_id).map(|e| e.count).unwrap_or(0);
        let next = (i64::from(current) + delta).clamp(0, i64::from(u32::MAX)) as u32;
        if next == 0 {
            rec.warm.remove(function_id);
        } else {
            let entry = rec
                .warm
                .entry(function_id.to_string())
                .or_insert(WarmEntry { count: 0, last_used_ms: now });
            entry.count = next;
            if delta > 0 {
                entry.last_used_ms = now;
            }
        }

        debug!(%node_id, %function_id, delta, warm = next, "warm delta applied");
        Ok(next)
    }

    /// Take one running slot on a node, waiting for its lock no later than
    /// `deadline`.
    pub fn try_reserve(&self, node_id: &str, function_id: &str, deadline: Instant) -> RegistryResult<Reservation> {
        let record = self.record(node_id)?;
        let now = self.clock.now_ms();
        let mut rec = record
            .try_lock_until(deadline)
            .ok_or_else(|| RegistryError::LockTimeout(node_id.to_string()))?;

        if rec.status(now, &self.config) == NodeStatus::Unhealthy {
            return Err(RegistryError::NodeUnavailable(node_id.to_string()));
        }
        if rec.running >= rec.max_running {
            return Err(RegistryError::NodeFull(node_id.to_string()));
        }
        rec.running += 1;

        let mode = match rec.warm.get_mut(function_id) {
            Some(entry) if entry.count > 0 => {
                entry.last_used_ms = now;
                ExecutionMode::Warm
            }
            _ => ExecutionMode::Cold,
        };
        Ok(Reservation {
            node_id: node_id.to_string(),
            mode,
            running: rec.running,
        })
    }

    /// Give back a slot taken by `try_reserve`.
    pub fn release(&self, node_id: &str) -> RegistryResult<()> {
        let record = self.record(node_id)?;
        let mut rec = record.lock();
        rec.running = rec.running.saturating_sub(1);
        Ok(())
    }

    /// Warm containers for a function across the placeable nodes of a pool.
    pub fn warm_for(&self, pool: PoolType, function_id: &str) -> u32 {
        self.list_healthy_nodes(pool)
            .iter()
            .map(|node| node.warm_for(function_id))
            .sum()
    }

    /// Placeable nodes holding warm containers for a function, least
    /// recently used first.
    pub fn lru_warm_nodes(&self, pool: PoolType, function_id: &str) -> Vec<(NodeId, WarmEntry)> {
        let mut holders: Vec<(NodeId, WarmEntry)> = self
            .list_healthy_nodes(pool)
            .into_iter()
            .filter_map(|node| node.warm.get(function_id).copied().map(|e| (node.node_id, e)))
            .filter(|(_, e)| e.count > 0)
            .collect();
        holders.sort_by(|a, b| a.1.last_used_ms.cmp(&b.1.last_used_ms).then_with(|| a.0.cmp(&b.0)));
        holders
    }

    /// Every (function, pool) with warm containers on a placeable node.
    pub fn warm_pairs(&self) -> Vec<(FunctionId, PoolType)> {
        let mut pairs: Vec<(FunctionId, PoolType)> = PoolType::ALL
            .iter()
            .flat_map(|&pool| {
                self.list_healthy_nodes(pool)
                    .into_iter()
                    .flat_map(move |node| node.warm.into_keys().map(move |f| (f, pool)))
            })
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// Quarantine a node until its next heartbeat.
    pub fn mark_unhealthy(&self, node_id: &str) -> RegistryResult<()> {
        let record = self.record(node_id)?;
        record.lock().quarantined = true;
        warn!(%node_id, "node marked unhealthy");
        Ok(())
    }

    /// Run `f` while holding a node's lock, as a slow heartbeat would.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_node_locked<R>(&self, node_id: &str, f: impl FnOnce() -> R) -> RegistryResult<R> {
        let record = self.record(node_id)?;
        let _held = record.lock();
        Ok(f())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
