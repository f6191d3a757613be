//! Demo mode: sample functions, a retention window of synthetic history, and
//! simulated node agents that keep their nodes alive and accept commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use prepline_api::NodeMailboxes;
use prepline_registry::{NodeRegistry, RegistryResult};
use prepline_state::{FunctionProfile, Heartbeat, NodeSpec, PoolType, Priority, Runtime};
use prepline_traffic::calendar::floor_to;
use prepline_traffic::{HOUR_MS, MINUTE_MS, SyntheticLoad, TrafficObserver};

const NODE_PREFIX: &str = "demo-";
const LIVE_MINUTES: u64 = 15;
pub const AGENT_INTERVAL: Duration = Duration::from_secs(5);

pub fn functions() -> Vec<FunctionProfile> {
    let mut auth = FunctionProfile::new("auth-check", Runtime::Go122, PoolType::Cpu);
    auth.default_priority = Priority::High;

    let mut transcode = FunctionProfile::new("video-transcode", Runtime::Go122, PoolType::Large);
    transcode.fallback_eligible = true;
    transcode.max_warm = Some(6);

    vec![
        FunctionProfile::new("image-resize", Runtime::Nodejs18, PoolType::Cpu),
        FunctionProfile::new("ml-inference", Runtime::Python311, PoolType::Gpu),
        transcode,
        auth,
    ]
}

fn base_qps(function_id: &str) -> f64 {
    match function_id {
        "image-resize" => 40.0,
        "ml-inference" => 12.0,
        "video-transcode" => 3.0,
        _ => 20.0,
    }
}

/// Hourly history covering the observer's retention plus live events for the
/// current hour, so the predictor and sizer have something to work with at
/// startup.
pub fn seed_history(observer: &TrafficObserver, profiles: &[FunctionProfile], now_ms: u64) {
    let hour_start = floor_to(now_ms, HOUR_MS);
    let live_from = now_ms.saturating_sub(LIVE_MINUTES * MINUTE_MS).max(hour_start);
    let history_ms = observer.config().coarse_retention.as_millis() as u64;

    for profile in profiles {
        let load = SyntheticLoad::new(base_qps(&profile.function_id));
        let samples = load.hourly_samples(
            &profile.function_id,
            hour_start.saturating_sub(history_ms),
            hour_start,
        );
        let hours = samples.len();
        observer.import_history(samples);

        let events = load.events(&profile.function_id, live_from, now_ms);
        let live = events.len();
        for event in events {
            observer.ingest(event);
        }
        info!(function_id = %profile.function_id, hours, live, "demo history seeded");
    }
}

fn nodes() -> Vec<NodeSpec> {
    let node = |id: &str, pool_type, free_cpu_percent, free_mem_gib, max_running| NodeSpec {
        node_id: format!("{NODE_PREFIX}{id}"),
        pool_type,
        free_cpu_percent,
        free_mem_gib,
        max_running,
    };
    vec![
        node("cpu-1", PoolType::Cpu, 80.0, 16.0, 32),
        node("cpu-2", PoolType::Cpu, 55.0, 8.0, 32),
        node("gpu-1", PoolType::Gpu, 70.0, 64.0, 8),
        node("large-1", PoolType::Large, 90.0, 128.0, 16),
    ]
}

pub fn register_nodes(registry: &NodeRegistry) -> RegistryResult<()> {
    for spec in nodes() {
        registry.register(spec)?;
    }
    Ok(())
}

/// Stand in for real node agents: take every queued command for the demo
/// nodes and heartbeat back the state the registry already holds.
pub async fn simulate_agents(
    registry: Arc<NodeRegistry>,
    mailboxes: Arc<NodeMailboxes>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "demo node agents started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for node in registry.list_nodes() {
                    if !node.node_id.starts_with(NODE_PREFIX) {
                        continue;
                    }
                    let accepted = mailboxes.drain(&node.node_id).len();
                    if accepted > 0 {
                        debug!(node_id = %node.node_id, accepted, "demo agent accepted commands");
                    }
                    let hb = Heartbeat {
                        free_cpu_percent: node.free_cpu_percent,
                        free_mem_gib: node.free_mem_gib,
                        running_functions_count: node.running_functions_count,
                        warm: node.warm.iter().map(|(f, e)| (f.clone(), e.count)).collect(),
                    };
                    if let Err(e) = registry.heartbeat(&node.node_id, &hb) {
                        warn!(node_id = %node.node_id, error = %e, "demo heartbeat failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("demo node agents shutting down");
                break;
            }
        }
    }
}
