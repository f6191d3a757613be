//! Domain records for the Prepline router.
//!
//! Nodes, traffic samples, routing decisions, and scale commands. Records
//! that reach the persistent store are JSON-serialized into redb value
//! columns, mirroring how they are served to dashboards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use prepline_core::types::*;

// ── Node ──────────────────────────────────────────────────────────

/// Health of a worker node as seen by placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Healthy,
    /// Still placeable, but close to its limits.
    Busy,
    /// Stale heartbeat or quarantined by failed commands. Never placeable.
    Unhealthy,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Busy => "BUSY",
            NodeStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

/// Static and initial attributes supplied when a node registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: NodeId,
    pub pool_type: PoolType,
    pub free_cpu_percent: f64,
    pub free_mem_gib: f64,
    /// Hard limit on concurrent invocations.
    pub max_running: u32,
}

/// Dynamic state reported by a node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub free_cpu_percent: f64,
    pub free_mem_gib: f64,
    pub running_functions_count: u32,
    /// Warm containers resident on the node, per function.
    #[serde(default)]
    pub warm: BTreeMap<FunctionId, u32>,
}

/// Warm containers of one function on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmEntry {
    pub count: u32,
    /// Last time a request reused (or a scale-up created) one of them.
    pub last_used_ms: u64,
}

/// Point-in-time view of a node, as returned by registry reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub pool_type: PoolType,
    pub free_cpu_percent: f64,
    pub free_mem_gib: f64,
    /// Total warm containers resident (sum over `warm`).
    pub current_warm: u32,
    pub warm: BTreeMap<FunctionId, WarmEntry>,
    pub running_functions_count: u32,
    pub max_running: u32,
    pub status: NodeStatus,
    pub last_heartbeat_ms: u64,
}

impl NodeSnapshot {
    /// Warm containers this node holds for `function_id`.
    pub fn warm_for(&self, function_id: &str) -> u32 {
        self.warm.get(function_id).map(|e| e.count).unwrap_or(0)
    }

    /// Whether another invocation fits under the hard limit.
    pub fn has_room(&self) -> bool {
        self.running_functions_count < self.max_running
    }
}

// ── Traffic ───────────────────────────────────────────────────────

/// Sliding-window statistics for one function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub qps: f64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
    /// Completed invocations inside the window.
    pub requests: u64,
}

/// Coarse health/popularity class shown next to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionStatus {
    Hot,
    Stable,
    ErrorProne,
    Cold,
}

/// One closed aggregation bucket of completed invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub function_id: FunctionId,
    /// Start of the bucket.
    pub timestamp_ms: u64,
    pub qps: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub count: u64,
}

impl TrafficSample {
    /// Build the composite key for the samples table.
    pub fn table_key(&self) -> String {
        sample_key(&self.function_id, self.timestamp_ms)
    }
}

pub(crate) fn sample_key(function_id: &str, timestamp_ms: u64) -> String {
    format!("{function_id}:{timestamp_ms:020}")
}

/// Average traffic for one (day-of-week, hour-of-day) slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapBucket {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub hour: u8,
    pub avg_qps: f64,
    pub avg_latency_ms: f64,
    pub sample_count: u32,
}

// ── Decisions ─────────────────────────────────────────────────────

/// The immutable outcome of one placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub run_id: String,
    pub function_id: FunctionId,
    pub pool_type: PoolType,
    pub node_id: NodeId,
    pub mode: ExecutionMode,
    /// Warm target in force when the decision was made.
    pub desired_warm: u32,
    pub priority: Priority,
    pub stats: FunctionStats,
    pub decided_at_ms: u64,
}

/// Fresh unique run identifier.
pub fn new_run_id() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}

/// A decision as retained in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub seq: u64,
    pub decision: RouterDecision,
    /// Warm containers for the function in the chosen pool at decision time.
    pub current_warm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
}

/// Instruction for a node agent to add or drain warm containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleCommand {
    pub node_id: NodeId,
    pub function_id: FunctionId,
    pub pool_type: PoolType,
    pub action: ScaleAction,
    pub delta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleOutcome {
    /// Delivered on the first attempt.
    Applied,
    /// Delivered after the immediate retry.
    Retried,
    /// Not delivered; the optimistic delta was reverted.
    Failed,
}

/// A pre-warm action as retained in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRecord {
    pub seq: u64,
    pub command: ScaleCommand,
    pub outcome: ScaleOutcome,
    pub issued_at_ms: u64,
}

/// Anything appended to the decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Decision(DecisionLogEntry),
    Scale(ScaleRecord),
}

impl LogRecord {
    pub fn seq(&self) -> u64 {
        match self {
            LogRecord::Decision(e) => e.seq,
            LogRecord::Scale(r) => r.seq,
        }
    }

    pub fn function_id(&self) -> &str {
        match self {
            LogRecord::Decision(e) => &e.decision.function_id,
            LogRecord::Scale(r) => &r.command.function_id,
        }
    }

    /// Build the composite key for the decisions table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.function_id(), self.seq())
    }
}

// ── Query views ───────────────────────────────────────────────────

/// Target vs. actual warm containers for a (function, pool).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmStatus {
    pub desired_warm: u32,
    pub current_warm: u32,
}

/// One minute of the QPS / warm-capacity timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub timestamp_ms: u64,
    pub qps: f64,
    pub desired_warm: u32,
    pub current_warm: u32,
}

/// Predicted (and, for past minutes, observed) traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub timestamp_ms: u64,
    pub actual_qps: Option<f64>,
    pub predicted_qps: f64,
    pub desired_warm: u32,
}
