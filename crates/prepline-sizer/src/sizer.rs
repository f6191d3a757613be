//! WarmPoolSizer — computes and publishes warm targets.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use prepline_core::SharedClock;
use prepline_core::config::SizerConfig;
use prepline_predict::PatternPredictor;
use prepline_state::{FunctionDirectory, FunctionProfile, PoolType, PredictionPoint};
use prepline_traffic::{MINUTE_MS, TrafficObserver, slot_of};

use crate::targets::WarmTargets;

/// Everything one sizing decision depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingInputs {
    pub current_qps: f64,
    pub predicted_qps: f64,
    /// Requests per second one warm container sustains.
    pub throughput: f64,
    pub safety_margin: u32,
    pub max_warm: Option<u32>,
    /// Target published by the previous tick, if any.
    pub previous: Option<u32>,
    /// Idle for longer than the cooldown.
    pub cooling_down: bool,
}

/// Warm target for one (function, pool).
///
/// While cooling down the previous target decays by exactly one per call
/// and never rises, whatever the traffic inputs say.
pub fn size(inputs: &SizingInputs) -> u32 {
    if inputs.cooling_down {
        if let Some(previous) = inputs.previous {
            return previous.saturating_sub(1);
        }
    }
    let demand = inputs.current_qps.max(inputs.predicted_qps).max(0.0);
    let containers = if inputs.throughput > 0.0 {
        (demand / inputs.throughput).ceil() as u32
    } else {
        0
    };
    let desired = containers.saturating_add(inputs.safety_margin);
    match inputs.max_warm {
        Some(cap) => desired.min(cap),
        None => desired,
    }
}

pub struct WarmPoolSizer {
    directory: Arc<dyn FunctionDirectory>,
    observer: Arc<TrafficObserver>,
    predictor: Arc<PatternPredictor>,
    config: SizerConfig,
    clock: SharedClock,
    /// Functions never seen since startup count as idle from here.
    started_at_ms: u64,
    targets: ArcSwap<WarmTargets>,
}

impl WarmPoolSizer {
    pub fn new(
        directory: Arc<dyn FunctionDirectory>,
        observer: Arc<TrafficObserver>,
        predictor: Arc<PatternPredictor>,
        config: SizerConfig,
        clock: SharedClock,
    ) -> Self {
        let started_at_ms = clock.now_ms();
        Self {
            directory,
            observer,
            predictor,
            config,
            clock,
            started_at_ms,
            targets: ArcSwap::from_pointee(WarmTargets::default()),
        }
    }

    fn predicted_qps(&self, function_id: &str) -> f64 {
        self.predictor
            .predicted_at_horizon(function_id)
            .unwrap_or_else(|| {
                self.predictor
                    .predict(function_id, self.predictor.config().horizon_minutes.max(1))
                    .last()
                    .map(|p| p.predicted_qps)
                    .unwrap_or(0.0)
            })
    }

    fn inputs_for(&self, profile: &FunctionProfile, pool: PoolType) -> SizingInputs {
        let function_id = profile.function_id.as_str();
        let now = self.clock.now_ms();
        let last_activity = self
            .observer
            .last_activity_ms(function_id)
            .unwrap_or(self.started_at_ms);
        let published = self.targets.load();
        SizingInputs {
            current_qps: self.observer.current_stats(function_id).qps,
            predicted_qps: self.predicted_qps(function_id),
            throughput: self.config.throughput.for_runtime(profile.runtime),
            safety_margin: self.config.safety_margin,
            max_warm: profile.max_warm,
            previous: published
                .contains(function_id, pool)
                .then(|| published.get(function_id, pool)),
            cooling_down: now.saturating_sub(last_activity) > self.config.cooldown.as_millis() as u64,
        }
    }

    /// Desired warm containers for a function in a pool. Only the
    /// function's preferred pool carries a target.
    pub fn compute_desired_warm(&self, function_id: &str, pool: PoolType) -> u32 {
        match self.directory.get_function_profile(function_id) {
            Some(profile) if profile.pool_type == pool => size(&self.inputs_for(&profile, pool)),
            _ => 0,
        }
    }

    /// Recompute every target and publish them in one swap.
    pub fn tick(&self) -> Arc<WarmTargets> {
        let previous = self.targets.load_full();
        let mut next = BTreeMap::new();

        for profile in self.directory.list_functions() {
            let pool = profile.pool_type;
            let desired = size(&self.inputs_for(&profile, pool));
            let before = previous.get(&profile.function_id, pool);
            if before != desired {
                info!(
                    function_id = %profile.function_id,
                    %pool,
                    from = before,
                    to = desired,
                    "warm target changed"
                );
            }
            next.insert((profile.function_id, pool), desired);
        }

        let snapshot = Arc::new(WarmTargets::new(next, self.clock.now_ms()));
        self.targets.store(Arc::clone(&snapshot));
        debug!(pairs = snapshot.len(), "warm targets published");
        snapshot
    }

    /// The current published snapshot.
    pub fn targets(&self) -> Arc<WarmTargets> {
        self.targets.load_full()
    }

    pub fn desired_warm(&self, function_id: &str, pool: PoolType) -> u32 {
        self.targets.load().get(function_id, pool)
    }

    /// Observed minutes over the lookback followed by forecast minutes,
    /// each with the warm target that traffic would call for.
    pub fn prediction(
        &self,
        function_id: &str,
        lookback_minutes: u32,
        horizon_minutes: u32,
    ) -> Vec<PredictionPoint> {
        let Some(profile) = self.directory.get_function_profile(function_id) else {
            return Vec::new();
        };
        let now = self.clock.now_ms();
        let target_for = |current_qps: f64, predicted_qps: f64| {
            size(&SizingInputs {
                current_qps,
                predicted_qps,
                throughput: self.config.throughput.for_runtime(profile.runtime),
                safety_margin: self.config.safety_margin,
                max_warm: profile.max_warm,
                previous: None,
                cooling_down: false,
            })
        };

        let buckets = self.observer.historical_buckets(function_id);
        let since = now.saturating_sub(u64::from(lookback_minutes) * MINUTE_MS);
        let mut points: Vec<PredictionPoint> = self
            .observer
            .fine_samples_since(function_id, since)
            .into_iter()
            .map(|sample| {
                let expected = buckets
                    .get(&slot_of(sample.timestamp_ms))
                    .filter(|b| b.sample_count > 0)
                    .map_or(sample.qps, |b| b.avg_qps);
                PredictionPoint {
                    timestamp_ms: sample.timestamp_ms,
                    actual_qps: Some(sample.qps),
                    predicted_qps: expected,
                    desired_warm: target_for(sample.qps, expected),
                }
            })
            .collect();

        points.extend(
            self.predictor
                .predict(function_id, horizon_minutes)
                .into_iter()
                .map(|p| PredictionPoint {
                    timestamp_ms: p.timestamp_ms,
                    actual_qps: None,
                    predicted_qps: p.predicted_qps,
                    desired_warm: target_for(0.0, p.predicted_qps),
                }),
        );
        points
    }

    /// Recompute targets on a fixed interval until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            safety_margin = self.config.safety_margin,
            "warm-pool sizer started"
        );
        self.tick();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    info!("warm-pool sizer shutting down");
                    break;
                }
            }
        }
    }
}
