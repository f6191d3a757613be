//! prepline.toml configuration parser.
//!
//! Every section is optional and falls back to its `Default`; durations are
//! written as strings (`"15s"`, `"5m"`) and parsed by [`crate::duration`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{FunctionProfile, Runtime};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreplineConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub traffic: TrafficConfig,
    pub predictor: PredictorConfig,
    pub sizer: SizerConfig,
    pub router: RouterConfig,
    pub prewarm: PrewarmConfig,
    pub decisions: DecisionsConfig,
    /// Static function directory used when no external registry is wired in.
    pub functions: Vec<FunctionProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: "/var/lib/prepline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A node with no heartbeat for this long reads as UNHEALTHY.
    #[serde(with = "serde_str")]
    pub heartbeat_timeout: Duration,
    /// Fraction of `max_running` at which a node reports BUSY.
    pub busy_ratio: f64,
    /// Free CPU percentage below which a node reports BUSY.
    pub busy_cpu_floor: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            busy_ratio: 0.8,
            busy_cpu_floor: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Sliding window for real-time QPS and error rate.
    #[serde(with = "serde_str")]
    pub window: Duration,
    /// Retention of per-minute samples.
    #[serde(with = "serde_str")]
    pub fine_retention: Duration,
    /// Retention of per-hour samples used for the heatmap.
    #[serde(with = "serde_str")]
    pub coarse_retention: Duration,
    /// Capacity of the completion-event channel.
    pub channel_capacity: usize,
    /// How often idle minute/hour buckets are closed.
    #[serde(with = "serde_str")]
    pub flush_interval: Duration,
    /// Functions at or above this QPS are classified HOT.
    pub hot_qps: f64,
    /// Functions at or above this error rate are classified ERROR_PRONE.
    pub error_prone_rate: f64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            fine_retention: Duration::from_secs(3600),
            coarse_retention: Duration::from_secs(7 * 86_400),
            channel_capacity: 65_536,
            flush_interval: Duration::from_secs(5),
            hot_qps: 10.0,
            error_prone_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Number of recent per-minute samples fitted for the trend line.
    pub trend_samples: usize,
    /// Minutes ahead at which the historical pattern gets full weight.
    pub blend_horizon_minutes: u32,
    /// Horizon used by the sizer.
    pub horizon_minutes: u32,
    #[serde(with = "serde_str")]
    pub refresh_interval: Duration,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            trend_samples: 10,
            blend_horizon_minutes: 30,
            horizon_minutes: 15,
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Requests per second one warm container sustains, per runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    pub nodejs: f64,
    pub python: f64,
    pub go: f64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            nodejs: 5.0,
            python: 2.0,
            go: 10.0,
        }
    }
}

impl ThroughputConfig {
    pub fn for_runtime(&self, runtime: Runtime) -> f64 {
        match runtime {
            Runtime::Nodejs18 => self.nodejs,
            Runtime::Python311 => self.python,
            Runtime::Go122 => self.go,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizerConfig {
    pub safety_margin: u32,
    /// Zero traffic for longer than this lets the target decay to zero.
    #[serde(with = "serde_str")]
    pub cooldown: Duration,
    #[serde(with = "serde_str")]
    pub tick_interval: Duration,
    pub throughput: ThroughputConfig,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            safety_margin: 2,
            cooldown: Duration::from_secs(600),
            tick_interval: Duration::from_secs(15),
            throughput: ThroughputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Error rate above which a function is refused admission.
    pub fatal_error_rate: f64,
    /// Minimum requests in the window before the error gate applies.
    pub min_requests_for_error_gate: u64,
    /// Pool utilisation (running / max_running) at which queuing starts.
    pub saturation_threshold: f64,
    /// Per-pool admission queue capacity.
    pub queue_capacity: usize,
    /// Longest a queued request waits before `Overloaded`.
    #[serde(with = "serde_str")]
    pub queue_wait: Duration,
    /// Upper bound on node-lock acquisition during placement.
    #[serde(with = "serde_str")]
    pub placement_timeout: Duration,
    #[serde(with = "serde_str")]
    pub pump_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fatal_error_rate: 0.5,
            min_requests_for_error_gate: 20,
            saturation_threshold: 0.85,
            queue_capacity: 64,
            queue_wait: Duration::from_secs(2),
            placement_timeout: Duration::from_millis(5),
            pump_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrewarmConfig {
    #[serde(with = "serde_str")]
    pub tick_interval: Duration,
    /// Commands issued per (function, pool) per tick.
    pub max_commands_per_tick: u32,
    /// Commands any single node receives per (function, pool) per tick.
    pub max_per_node_per_tick: u32,
    /// Surplus must persist this long before scale-down.
    #[serde(with = "serde_str")]
    pub scale_down_grace: Duration,
    #[serde(with = "serde_str")]
    pub command_timeout: Duration,
    /// Consecutive failed commands before a node is marked UNHEALTHY.
    pub node_failure_threshold: u32,
    pub command_channel_capacity: usize,
    /// Timeline points retained per (function, pool).
    pub timeline_points: usize,
}

impl Default for PrewarmConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(20),
            max_commands_per_tick: 8,
            max_per_node_per_tick: 2,
            scale_down_grace: Duration::from_secs(60),
            command_timeout: Duration::from_secs(2),
            node_failure_threshold: 3,
            command_channel_capacity: 1024,
            timeline_points: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionsConfig {
    pub max_entries_per_function: usize,
}

impl Default for DecisionsConfig {
    fn default() -> Self {
        Self {
            max_entries_per_function: 1000,
        }
    }
}

impl PreplineConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: PreplineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would make the control loops misbehave.
    pub fn validate(&self) -> ConfigResult<()> {
        let t = &self.sizer.throughput;
        if [t.nodejs, t.python, t.go].iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(ConfigError::Invalid(
                "sizer.throughput values must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.router.saturation_threshold) {
            return Err(ConfigError::Invalid(
                "router.saturation_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.traffic.window.is_zero() {
            return Err(ConfigError::Invalid("traffic.window must be non-zero".to_string()));
        }
        if self.predictor.blend_horizon_minutes == 0 {
            return Err(ConfigError::Invalid(
                "predictor.blend_horizon_minutes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoolType;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PreplineConfig::from_toml_str("").unwrap();
        assert_eq!(config.sizer.safety_margin, 2);
        assert_eq!(config.registry.heartbeat_timeout, Duration::from_secs(30));
        assert!(config.functions.is_empty());
    }

    #[test]
    fn parses_sections_and_functions() {
        let toml_str = r#"
[sizer]
safety_margin = 1
cooldown = "5m"

[sizer.throughput]
python = 4.0

[router]
placement_timeout = "10ms"

[[functions]]
function_id = "fn-001"
name = "image-processor"
runtime = "python-3.11"
pool_type = "GPU"
default_priority = "HIGH"
"#;
        let config = PreplineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.sizer.safety_margin, 1);
        assert_eq!(config.sizer.cooldown, Duration::from_secs(300));
        assert_eq!(config.sizer.throughput.for_runtime(Runtime::Python311), 4.0);
        assert_eq!(config.sizer.throughput.for_runtime(Runtime::Go122), 10.0);
        assert_eq!(config.router.placement_timeout, Duration::from_millis(10));
        assert_eq!(config.functions.len(), 1);
        assert_eq!(config.functions[0].pool_type, PoolType::Gpu);
    }

    #[test]
    fn rejects_bad_duration() {
        let result = PreplineConfig::from_toml_str("[sizer]\ncooldown = \"later\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_non_positive_throughput() {
        let result = PreplineConfig::from_toml_str("[sizer.throughput]\ngo = 0.0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = PreplineConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed = PreplineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.prewarm.tick_interval, config.prewarm.tick_interval);
        assert_eq!(parsed.traffic.coarse_retention, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepline.toml");
        std::fs::write(&path, "[server]\nport = 9090\n").unwrap();
        let config = PreplineConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 9090);
    }
}
