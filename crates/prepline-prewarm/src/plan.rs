//! Pure command planning for one (function, pool) per tick.

use prepline_state::{NodeId, NodeSnapshot, PoolType, ScaleAction, ScaleCommand, WarmEntry};

fn command(node_id: &str, function_id: &str, pool: PoolType, action: ScaleAction) -> ScaleCommand {
    ScaleCommand {
        node_id: node_id.to_string(),
        function_id: function_id.to_string(),
        pool_type: pool,
        action,
        delta: 1,
    }
}

/// Spread `count` single-container scale-ups round-robin over `nodes`
/// (already in capacity order), giving no node more than `per_node`.
pub fn plan_scale_up(
    function_id: &str,
    pool: PoolType,
    count: u32,
    nodes: &[NodeSnapshot],
    per_node: u32,
) -> Vec<ScaleCommand> {
    let mut commands = Vec::new();
    for _round in 0..per_node {
        for node in nodes {
            if commands.len() as u32 >= count {
                return commands;
            }
            commands.push(command(&node.node_id, function_id, pool, ScaleAction::ScaleUp));
        }
    }
    commands
}

/// Drain `count` warm containers from `holders` (least recently used
/// first), taking at most `per_node` from any one node.
pub fn plan_scale_down(
    function_id: &str,
    pool: PoolType,
    count: u32,
    holders: &[(NodeId, WarmEntry)],
    per_node: u32,
) -> Vec<ScaleCommand> {
    let mut commands = Vec::new();
    for (node_id, entry) in holders {
        let take = entry.count.min(per_node);
        for _ in 0..take {
            if commands.len() as u32 >= count {
                return commands;
            }
            commands.push(command(node_id, function_id, pool, ScaleAction::ScaleDown));
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use prepline_state::NodeStatus;

    fn node(id: &str) -> NodeSnapshot {
        NodeSnapshot {
            node_id: id.to_string(),
            pool_type: PoolType::Gpu,
            free_cpu_percent: 50.0,
            free_mem_gib: 8.0,
            current_warm: 0,
            warm: BTreeMap::new(),
            running_functions_count: 0,
            max_running: 4,
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
        }
    }

    fn targets(commands: &[ScaleCommand]) -> Vec<&str> {
        commands.iter().map(|c| c.node_id.as_str()).collect()
    }

    #[test]
    fn scale_up_round_robins_within_limits() {
        let nodes = [node("a"), node("b")];
        let plan = plan_scale_up("f", PoolType::Gpu, 3, &nodes, 2);
        assert_eq!(targets(&plan), vec!["a", "b", "a"]);
        assert!(plan.iter().all(|c| c.delta == 1 && c.action == ScaleAction::ScaleUp));

        let capped = plan_scale_up("f", PoolType::Gpu, 10, &nodes, 2);
        assert_eq!(capped.len(), 4);
        assert!(plan_scale_up("f", PoolType::Gpu, 3, &[], 2).is_empty());
    }

    #[test]
    fn scale_down_drains_lru_first() {
        let holders = vec![
            ("old".to_string(), WarmEntry { count: 3, last_used_ms: 1 }),
            ("new".to_string(), WarmEntry { count: 1, last_used_ms: 9 }),
        ];
        let plan = plan_scale_down("f", PoolType::Cpu, 3, &holders, 2);
        assert_eq!(targets(&plan), vec!["old", "old", "new"]);
        assert_eq!(plan_scale_down("f", PoolType::Cpu, 1, &holders, 2).len(), 1);
    }
}
