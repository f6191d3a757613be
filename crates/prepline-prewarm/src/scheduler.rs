//! PrewarmScheduler — moves warm containers toward their targets.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use prepline_core::SharedClock;
use prepline_core::config::PrewarmConfig;
use prepline_decisions::DecisionLog;
use prepline_registry::{NodeRegistry, RegistryError};
use prepline_sizer::{WarmPoolSizer, WarmTargets};
use prepline_state::{
    FunctionId, NodeId, PoolType, ScaleAction, ScaleCommand, ScaleOutcome, TimelinePoint, WarmStatus,
};
use prepline_traffic::{MINUTE_MS, TrafficObserver};

use crate::agent::NodeAgent;
use crate::error::{PrewarmError, PrewarmResult};
use crate::plan::{plan_scale_down, plan_scale_up};

type Pair = (FunctionId, PoolType);

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pairs: usize,
    pub applied: u32,
    pub failed: u32,
    /// Pairs whose remaining commands were pushed to the next tick.
    pub deferred: usize,
}

#[derive(Debug, Default)]
struct PairReport {
    applied: u32,
    failed: u32,
    deferred: bool,
}

pub struct PrewarmScheduler {
    registry: Arc<NodeRegistry>,
    sizer: Arc<WarmPoolSizer>,
    observer: Arc<TrafficObserver>,
    log: Arc<DecisionLog>,
    agent: Arc<dyn NodeAgent>,
    config: PrewarmConfig,
    clock: SharedClock,
    /// When each pair first showed more warm containers than its target.
    surplus_since: DashMap<Pair, u64>,
    /// Consecutive undelivered commands per node.
    failures: DashMap<NodeId, u32>,
    timelines: DashMap<Pair, Arc<Mutex<VecDeque<TimelinePoint>>>>,
}

impl PrewarmScheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sizer: Arc<WarmPoolSizer>,
        observer: Arc<TrafficObserver>,
        log: Arc<DecisionLog>,
        agent: Arc<dyn NodeAgent>,
        config: PrewarmConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            sizer,
            observer,
            log,
            agent,
            config,
            clock,
            surplus_since: DashMap::new(),
            failures: DashMap::new(),
            timelines: DashMap::new(),
        }
    }

    pub fn warm_status(&self, function_id: &str, pool: PoolType) -> WarmStatus {
        WarmStatus {
            desired_warm: self.sizer.desired_warm(function_id, pool),
            current_warm: self.registry.warm_for(pool, function_id),
        }
    }

    /// Per-minute QPS and warm capacity, oldest first.
    pub fn timeline(&self, function_id: &str, pool: PoolType) -> Vec<TimelinePoint> {
        self.timelines
            .get(&(function_id.to_string(), pool))
            .map(|t| t.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Consecutive failed deliveries to a node.
    pub fn failure_count(&self, node_id: &str) -> u32 {
        self.failures.get(node_id).map(|f| *f).unwrap_or(0)
    }

    /// Every pair with a target, plus pairs that still hold warm
    /// containers without one.
    fn pairs(&self, targets: &WarmTargets) -> BTreeSet<Pair> {
        targets
            .iter()
            .map(|(f, pool, _)| (f.clone(), pool))
            .chain(self.registry.warm_pairs())
            .collect()
    }

    /// Reconcile every pair once. Pairs run concurrently; commands within
    /// a pair are issued in order.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let targets = self.sizer.targets();
        let pairs = self.pairs(&targets);
        let mut report = TickReport {
            pairs: pairs.len(),
            ..TickReport::default()
        };

        let mut set = JoinSet::new();
        for (function_id, pool) in pairs {
            let this = Arc::clone(self);
            let desired = targets.get(&function_id, pool);
            set.spawn(async move { this.reconcile(&function_id, pool, desired).await });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => {
                    report.applied += pair.applied;
                    report.failed += pair.failed;
                    report.deferred += usize::from(pair.deferred);
                }
                Err(e) => warn!(error = %e, "pre-warm pair task failed"),
            }
        }

        if report.applied > 0 || report.failed > 0 {
            info!(
                pairs = report.pairs,
                applied = report.applied,
                failed = report.failed,
                deferred = report.deferred,
                "pre-warm tick"
            );
        }
        report
    }

    fn record_timeline(&self, function_id: &str, pool: PoolType, desired: u32, current: u32) {
        let now = self.clock.now_ms();
        let point = TimelinePoint {
            timestamp_ms: now - now % MINUTE_MS,
            qps: self.observer.current_stats(function_id).qps,
            desired_warm: desired,
            current_warm: current,
        };
        let timeline = Arc::clone(
            self.timelines
                .entry((function_id.to_string(), pool))
                .or_default()
                .value(),
        );
        let mut points = timeline.lock();
        if points.back().is_some_and(|p| p.timestamp_ms == point.timestamp_ms) {
            points.pop_back();
        }
        points.push_back(point);
        while points.len() > self.config.timeline_points.max(1) {
            points.pop_front();
        }
    }

    fn plan(&self, function_id: &str, pool: PoolType, desired: u32, current: u32) -> Vec<ScaleCommand> {
        let key = (function_id.to_string(), pool);
        let limit = self.config.max_commands_per_tick;
        let per_node = self.config.max_per_node_per_tick;

        if desired > current {
            self.surplus_since.remove(&key);
            let nodes = self.registry.list_healthy_nodes(pool);
            return plan_scale_up(function_id, pool, (desired - current).min(limit), &nodes, per_node);
        }
        if current == desired {
            self.surplus_since.remove(&key);
            return Vec::new();
        }

        let now = self.clock.now_ms();
        let since = *self.surplus_since.entry(key).or_insert(now);
        let grace = self.config.scale_down_grace.as_millis() as u64;
        if now.saturating_sub(since) < grace {
            debug!(%function_id, %pool, desired, current, "surplus within grace period");
            return Vec::new();
        }
        let holders = self.registry.lru_warm_nodes(pool, function_id);
        plan_scale_down(function_id, pool, (current - desired).min(limit), &holders, per_node)
    }

    async fn reconcile(&self, function_id: &str, pool: PoolType, desired: u32) -> PairReport {
        let current = self.registry.warm_for(pool, function_id);
        self.record_timeline(function_id, pool, desired, current);

        let mut report = PairReport::default();
        for command in self.plan(function_id, pool, desired, current) {
            match self.execute(&command).await {
                Ok(ScaleOutcome::Failed) => {
                    report.failed += 1;
                    report.deferred = true;
                    break;
                }
                Ok(_) => report.applied += 1,
                Err(e) => {
                    // The node vanished or changed; the next tick re-reads the registry.
                    warn!(%function_id, %pool, node_id = %command.node_id, error = %e, "scale command skipped");
                    report.deferred = true;
                    break;
                }
            }
        }
        report
    }

    async fn deliver(&self, command: &ScaleCommand) -> PrewarmResult<()> {
        match tokio::time::timeout(self.config.command_timeout, self.agent.dispatch(command)).await {
            Ok(result) => result,
            Err(_) => Err(PrewarmError::CommandTimeout {
                node_id: command.node_id.clone(),
            }),
        }
    }

    /// Apply a command optimistically, deliver it with one immediate retry,
    /// and revert on failure.
    async fn execute(&self, command: &ScaleCommand) -> PrewarmResult<ScaleOutcome> {
        let delta = match command.action {
            ScaleAction::ScaleUp => i64::from(command.delta),
            ScaleAction::ScaleDown => -i64::from(command.delta),
        };
        let node_id = command.node_id.as_str();
        self.registry
            .apply_warm_delta(node_id, &command.function_id, delta)?;

        let outcome = match self.deliver(command).await {
            Ok(()) => ScaleOutcome::Applied,
            Err(first) => {
                warn!(%node_id, function_id = %command.function_id, error = %first, "scale command failed, retrying");
                match self.deliver(command).await {
                    Ok(()) => ScaleOutcome::Retried,
                    Err(second) => {
                        self.revert(command, delta);
                        self.note_failure(node_id, &second);
                        ScaleOutcome::Failed
                    }
                }
            }
        };
        if outcome != ScaleOutcome::Failed {
            self.failures.remove(node_id);
        }

        let record = self.log.append_scale(command.clone(), outcome, self.clock.now_ms());
        debug!(
            %node_id,
            function_id = %command.function_id,
            action = ?command.action,
            ?outcome,
            seq = record.seq,
            "scale command"
        );
        Ok(outcome)
    }

    fn revert(&self, command: &ScaleCommand, delta: i64) {
        match self
            .registry
            .apply_warm_delta(&command.node_id, &command.function_id, -delta)
        {
            Ok(_) | Err(RegistryError::NodeNotFound(_)) => {}
            Err(e) => warn!(node_id = %command.node_id, error = %e, "revert of warm delta failed"),
        }
    }

    fn note_failure(&self, node_id: &str, error: &PrewarmError) {
        let failures = {
            let mut count = self.failures.entry(node_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(%node_id, failures, error = %error, "scale command undelivered");
        if failures >= self.config.node_failure_threshold {
            if let Err(e) = self.registry.mark_unhealthy(node_id) {
                warn!(%node_id, error = %e, "could not mark node unhealthy");
            }
        }
    }

    /// Tick on a fixed interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            max_commands = self.config.max_commands_per_tick,
            "pre-warm scheduler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("pre-warm scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use prepline_core::ManualClock;
    use prepline_core::config::{DecisionsConfig, PredictorConfig, RegistryConfig, SizerConfig, TrafficConfig};
    use prepline_predict::PatternPredictor;
    use prepline_state::{FunctionDirectory, FunctionProfile, Heartbeat, NodeSpec, NodeStatus, Runtime, StaticDirectory};

    use crate::agent::AgentFuture;

    const T0: u64 = 1_704_067_200_000;

    /// Records deliveries; fails the first `fail_first` attempts.
    #[derive(Default)]
    struct ScriptedAgent {
        fail_first: u32,
        attempts: AtomicU32,
        delivered: Mutex<Vec<ScaleCommand>>,
    }

    impl ScriptedAgent {
        fn failing(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Self::default()
            }
        }
    }

    impl NodeAgent for ScriptedAgent {
        fn dispatch<'a>(&'a self, command: &'a ScaleCommand) -> AgentFuture<'a> {
            Box::pin(async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.fail_first {
                    return Err(PrewarmError::Rejected {
                        node_id: command.node_id.clone(),
                        reason: "busy".into(),
                    });
                }
                self.delivered.lock().push(command.clone());
                Ok(())
            })
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        registry: Arc<NodeRegistry>,
        sizer: Arc<WarmPoolSizer>,
        log: Arc<DecisionLog>,
        agent: Arc<ScriptedAgent>,
        scheduler: Arc<PrewarmScheduler>,
    }

    fn harness(profile: FunctionProfile, safety_margin: u32, config: PrewarmConfig, agent: ScriptedAgent) -> Harness {
        let clock = ManualClock::new(T0);
        let shared: SharedClock = clock.clone();
        let directory: Arc<dyn FunctionDirectory> = Arc::new(StaticDirectory::new([profile]));
        let registry = Arc::new(NodeRegistry::new(RegistryConfig::default(), shared.clone()));
        let observer = Arc::new(TrafficObserver::new(TrafficConfig::default(), shared.clone()));
        let predictor = Arc::new(PatternPredictor::new(
            Arc::clone(&observer),
            PredictorConfig::default(),
            shared.clone(),
        ));
        let sizer = Arc::new(WarmPoolSizer::new(
            directory,
            Arc::clone(&observer),
            predictor,
            SizerConfig {
                safety_margin,
                ..SizerConfig::default()
            },
            shared.clone(),
        ));
        let log = Arc::new(DecisionLog::new(&DecisionsConfig::default()));
        let agent = Arc::new(agent);
        let dyn_agent: Arc<dyn NodeAgent> = agent.clone();
        let scheduler = Arc::new(PrewarmScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&sizer),
            observer,
            Arc::clone(&log),
            dyn_agent,
            config,
            shared,
        ));
        Harness {
            clock,
            registry,
            sizer,
            log,
            agent,
            scheduler,
        }
    }

    fn add_node(registry: &NodeRegistry, id: &str, pool: PoolType, warm: &[(&str, u32)]) {
        registry
            .register(NodeSpec {
                node_id: id.to_string(),
                pool_type: pool,
                free_cpu_percent: 70.0,
                free_mem_gib: 32.0,
                max_running: 8,
            })
            .unwrap();
        registry
            .heartbeat(
                id,
                &Heartbeat {
                    free_cpu_percent: 70.0,
                    free_mem_gib: 32.0,
                    running_functions_count: 0,
                    warm: warm.iter().map(|(f, n)| (f.to_string(), *n)).collect::<BTreeMap<_, _>>(),
                },
            )
            .unwrap();
    }

    fn gpu_fn() -> FunctionProfile {
        FunctionProfile::new("f3", Runtime::Python311, PoolType::Gpu)
    }

    #[tokio::test]
    async fn scale_up_closes_the_gap() {
        let h = harness(gpu_fn(), 5, PrewarmConfig::default(), ScriptedAgent::default());
        add_node(&h.registry, "g1", PoolType::Gpu, &[("f3", 2)]);
        add_node(&h.registry, "g2", PoolType::Gpu, &[]);
        h.sizer.tick();
        assert_eq!(h.scheduler.warm_status("f3", PoolType::Gpu), WarmStatus { desired_warm: 5, current_warm: 2 });

        let report = h.scheduler.tick().await;
        assert_eq!(report.applied, 3);
        let delivered = h.agent.delivered.lock().clone();
        assert_eq!(delivered.iter().map(|c| c.delta).sum::<u32>(), 3);
        assert!(delivered.iter().all(|c| c.action == ScaleAction::ScaleUp));
        assert_eq!(h.registry.warm_for(PoolType::Gpu, "f3"), 5);
        assert_eq!(h.log.scale_history("f3", 10).len(), 3);

        // Already at target: nothing more to do.
        assert_eq!(h.scheduler.tick().await.applied, 0);
    }

    #[tokio::test]
    async fn scale_up_respects_per_tick_limit() {
        let config = PrewarmConfig {
            max_commands_per_tick: 2,
            ..PrewarmConfig::default()
        };
        let h = harness(gpu_fn(), 5, config, ScriptedAgent::default());
        add_node(&h.registry, "g1", PoolType::Gpu, &[("f3", 2)]);
        add_node(&h.registry, "g2", PoolType::Gpu, &[]);
        h.sizer.tick();

        assert_eq!(h.scheduler.tick().await.applied, 2);
        assert_eq!(h.registry.warm_for(PoolType::Gpu, "f3"), 4);
        assert_eq!(h.scheduler.tick().await.applied, 1);
        assert_eq!(h.registry.warm_for(PoolType::Gpu, "f3"), 5);
    }

    #[tokio::test]
    async fn scale_down_waits_for_grace_and_drains_lru() {
        let config = PrewarmConfig {
            scale_down_grace: Duration::from_secs(10),
            ..PrewarmConfig::default()
        };
        let profile = FunctionProfile::new("f1", Runtime::Go122, PoolType::Cpu);
        let h = harness(profile, 0, config, ScriptedAgent::default());
        add_node(&h.registry, "n1", PoolType::Cpu, &[("f1", 1)]);
        h.clock.advance(Duration::from_secs(5));
        add_node(&h.registry, "n2", PoolType::Cpu, &[("f1", 1)]);
        h.sizer.tick();

        assert_eq!(h.scheduler.tick().await.applied, 0);
        assert_eq!(h.registry.warm_for(PoolType::Cpu, "f1"), 2);

        h.clock.advance(Duration::from_secs(10));
        assert_eq!(h.scheduler.tick().await.applied, 2);
        let order: Vec<String> = h.agent.delivered.lock().iter().map(|c| c.node_id.clone()).collect();
        assert_eq!(order, vec!["n1", "n2"]);
        assert_eq!(h.registry.warm_for(PoolType::Cpu, "f1"), 0);
    }

    #[tokio::test]
    async fn untargeted_warm_pairs_drain() {
        let config = PrewarmConfig {
            scale_down_grace: Duration::ZERO,
            ..PrewarmConfig::default()
        };
        let h = harness(gpu_fn(), 1, config, ScriptedAgent::default());
        add_node(&h.registry, "c1", PoolType::Cpu, &[("legacy", 2)]);
        h.sizer.tick();

        let report = h.scheduler.tick().await;
        assert_eq!(report.pairs, 2);
        assert_eq!(h.registry.warm_for(PoolType::Cpu, "legacy"), 0);
    }

    #[tokio::test]
    async fn one_failure_is_retried() {
        let h = harness(gpu_fn(), 2, PrewarmConfig::default(), ScriptedAgent::failing(1));
        add_node(&h.registry, "g1", PoolType::Gpu, &[]);
        h.sizer.tick();

        let report = h.scheduler.tick().await;
        assert_eq!((report.applied, report.failed), (2, 0));
        let outcomes: Vec<ScaleOutcome> = h
            .log
            .scale_history("f3", 10)
            .into_iter()
            .rev()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(outcomes, vec![ScaleOutcome::Retried, ScaleOutcome::Applied]);
        assert_eq!(h.registry.warm_for(PoolType::Gpu, "f3"), 2);
        assert_eq!(h.scheduler.failure_count("g1"), 0);
    }

    #[tokio::test]
    async fn repeated_failures_revert_and_quarantine() {
        let config = PrewarmConfig {
            node_failure_threshold: 2,
            ..PrewarmConfig::default()
        };
        let h = harness(gpu_fn(), 2, config, ScriptedAgent::failing(u32::MAX));
        add_node(&h.registry, "g1", PoolType::Gpu, &[]);
        h.sizer.tick();

        let first = h.scheduler.tick().await;
        assert_eq!((first.applied, first.failed, first.deferred), (0, 1, 1));
        assert_eq!(h.registry.warm_for(PoolType::Gpu, "f3"), 0);
        assert_eq!(h.registry.snapshot("g1").unwrap().status, NodeStatus::Healthy);

        h.scheduler.tick().await;
        assert_eq!(h.scheduler.failure_count("g1"), 2);
        assert_eq!(h.registry.snapshot("g1").unwrap().status, NodeStatus::Unhealthy);
        assert_eq!(h.registry.snapshot("g1").unwrap().warm_for("f3"), 0);
        assert_eq!(h.agent.attempts.load(Ordering::SeqCst), 4);
        assert!(
            h.log
                .scale_history("f3", 10)
                .iter()
                .all(|r| r.outcome == ScaleOutcome::Failed)
        );
    }

    #[tokio::test]
    async fn timeline_keeps_one_point_per_minute() {
        let config = PrewarmConfig {
            timeline_points: 2,
            ..PrewarmConfig::default()
        };
        let h = harness(gpu_fn(), 1, config, ScriptedAgent::default());
        add_node(&h.registry, "g1", PoolType::Gpu, &[]);
        h.sizer.tick();

        h.scheduler.tick().await;
        h.clock.advance(Duration::from_secs(20));
        h.scheduler.tick().await;
        let points = h.scheduler.timeline("f3", PoolType::Gpu);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp_ms, T0);
        assert_eq!((points[0].desired_warm, points[0].current_warm), (1, 1));

        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(60));
            h.scheduler.tick().await;
        }
        let points = h.scheduler.timeline("f3", PoolType::Gpu);
        assert_eq!(points.len(), 2);
        assert!(points[0].timestamp_ms < points[1].timestamp_ms);
        assert!(h.scheduler.timeline("nope", PoolType::Cpu).is_empty());
    }
}
