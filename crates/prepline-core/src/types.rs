//! Closed vocabularies shared by placement, sizing, and scheduling.
//!
//! Pools, priorities, runtimes, and execution modes are exhaustive enums so
//! every decision path is matched statically rather than by string compare.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Unique identifier of a registered function.
pub type FunctionId = String;

/// Unique identifier of a worker node.
pub type NodeId = String;

// ── Pool ──────────────────────────────────────────────────────────

/// A group of worker nodes sharing a resource profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolType {
    Cpu,
    Gpu,
    Large,
}

impl PoolType {
    /// All pools, in fallback search order.
    pub const ALL: [PoolType; 3] = [PoolType::Cpu, PoolType::Gpu, PoolType::Large];

    /// Dense index for per-pool arrays.
    pub fn index(self) -> usize {
        match self {
            PoolType::Cpu => 0,
            PoolType::Gpu => 1,
            PoolType::Large => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolType::Cpu => "CPU",
            PoolType::Gpu => "GPU",
            PoolType::Large => "LARGE",
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CPU" => Ok(PoolType::Cpu),
            "GPU" => Ok(PoolType::Gpu),
            "LARGE" => Ok(PoolType::Large),
            _ => Err(ConfigError::UnknownPool(s.to_string())),
        }
    }
}

// ── Priority ──────────────────────────────────────────────────────

/// Admission priority. Ordering is by importance: `Low < ... < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            _ => Err(ConfigError::UnknownPriority(s.to_string())),
        }
    }
}

// ── Runtime ───────────────────────────────────────────────────────

/// Language runtime of a function; selects the per-container throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    #[serde(rename = "nodejs-18")]
    Nodejs18,
    #[serde(rename = "python-3.11")]
    Python311,
    #[serde(rename = "go-1.22")]
    Go122,
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Runtime::Nodejs18 => "nodejs-18",
            Runtime::Python311 => "python-3.11",
            Runtime::Go122 => "go-1.22",
        })
    }
}

// ── Execution mode ────────────────────────────────────────────────

/// Outcome of placement: reuse a warm container or cold-start a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Warm,
    Cold,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Warm => "warm",
            ExecutionMode::Cold => "cold",
        })
    }
}

// ── Function profile ──────────────────────────────────────────────

/// Externally-managed function metadata. The router only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProfile {
    pub function_id: FunctionId,
    #[serde(default)]
    pub name: String,
    pub runtime: Runtime,
    /// Preferred pool.
    pub pool_type: PoolType,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    /// May the router place this function outside its preferred pool?
    #[serde(default)]
    pub fallback_eligible: bool,
    /// Target latency one warm container must sustain.
    #[serde(default = "default_sla_latency_ms")]
    pub sla_latency_ms: u32,
    /// Priority used when the caller does not specify one.
    #[serde(default)]
    pub default_priority: Priority,
    /// Optional cap on the warm target.
    #[serde(default)]
    pub max_warm: Option<u32>,
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_sla_latency_ms() -> u32 {
    500
}

impl FunctionProfile {
    /// Minimal profile, mostly for tests and fixtures.
    pub fn new(function_id: &str, runtime: Runtime, pool_type: PoolType) -> Self {
        Self {
            function_id: function_id.to_string(),
            name: function_id.to_string(),
            runtime,
            pool_type,
            timeout_seconds: default_timeout_seconds(),
            fallback_eligible: false,
            sla_latency_ms: default_sla_latency_ms(),
            default_priority: Priority::Medium,
            max_warm: None,
        }
    }
}
