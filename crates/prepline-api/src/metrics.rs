//! Prometheus text exposition.

use prepline_router::RouterStats;
use prepline_state::{FunctionId, NodeSnapshot, NodeStatus, PoolType};

/// Everything `/metrics` reports, gathered in one pass.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub router: RouterStats,
    pub nodes: Vec<NodeSnapshot>,
    pub decisions_total: u64,
    pub scale_actions_total: u64,
    pub events_dropped: u64,
    /// (function, pool, desired, current) for every targeted pair.
    pub warm: Vec<(FunctionId, PoolType, u32, u32)>,
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

pub fn render_prometheus(m: &MetricsSnapshot) -> String {
    let mut out = String::new();
    let r = &m.router;

    header(&mut out, "prepline_placements_total", "counter", "Committed placements by execution mode.");
    out.push_str(&format!("prepline_placements_total{{mode=\"warm\"}} {}\n", r.warm_total));
    out.push_str(&format!("prepline_placements_total{{mode=\"cold\"}} {}\n", r.cold_total));

    header(&mut out, "prepline_queued_total", "counter", "Requests that entered an admission queue.");
    out.push_str(&format!("prepline_queued_total {}\n", r.queued_total));

    header(&mut out, "prepline_rejected_total", "counter", "Requests rejected by the router.");
    out.push_str(&format!("prepline_rejected_total {}\n", r.rejected_total));

    header(&mut out, "prepline_placement_timeouts_total", "counter", "Placements that hit the lock deadline.");
    out.push_str(&format!("prepline_placement_timeouts_total {}\n", r.timeouts_total));

    header(&mut out, "prepline_in_flight", "gauge", "Placed invocations awaiting completion.");
    out.push_str(&format!("prepline_in_flight {}\n", r.in_flight));

    header(&mut out, "prepline_queue_depth", "gauge", "Requests waiting per pool.");
    for (pool, depth) in &r.queue_depths {
        out.push_str(&format!("prepline_queue_depth{{pool=\"{pool}\"}} {depth}\n"));
    }

    header(&mut out, "prepline_nodes", "gauge", "Registered nodes by pool and status.");
    for pool in PoolType::ALL {
        for status in [NodeStatus::Healthy, NodeStatus::Busy, NodeStatus::Unhealthy] {
            let count = m
                .nodes
                .iter()
                .filter(|n| n.pool_type == pool && n.status == status)
                .count();
            out.push_str(&format!(
                "prepline_nodes{{pool=\"{pool}\",status=\"{}\"}} {count}\n",
                status.as_str()
            ));
        }
    }

    header(&mut out, "prepline_running_functions", "gauge", "Running invocations per node.");
    for n in &m.nodes {
        out.push_str(&format!(
            "prepline_running_functions{{node=\"{}\",pool=\"{}\"}} {}\n",
            n.node_id, n.pool_type, n.running_functions_count
        ));
    }

    header(&mut out, "prepline_warm_desired", "gauge", "Warm-container target per function and pool.");
    for (function_id, pool, desired, _) in &m.warm {
        out.push_str(&format!(
            "prepline_warm_desired{{function=\"{function_id}\",pool=\"{pool}\"}} {desired}\n"
        ));
    }
    header(&mut out, "prepline_warm_current", "gauge", "Warm containers per function and pool.");
    for (function_id, pool, _, current) in &m.warm {
        out.push_str(&format!(
            "prepline_warm_current{{function=\"{function_id}\",pool=\"{pool}\"}} {current}\n"
        ));
    }

    header(&mut out, "prepline_decisions_total", "counter", "Placements appended to the decision log.");
    out.push_str(&format!("prepline_decisions_total {}\n", m.decisions_total));

    header(&mut out, "prepline_scale_actions_total", "counter", "Scale commands appended to the decision log.");
    out.push_str(&format!("prepline_scale_actions_total {}\n", m.scale_actions_total));

    header(&mut out, "prepline_traffic_events_dropped_total", "counter", "Completion events dropped on a full channel.");
    out.push_str(&format!("prepline_traffic_events_dropped_total {}\n", m.events_dropped));

    out
}
