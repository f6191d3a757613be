//! PatternPredictor — forecasts fed from the traffic observer.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use prepline_core::SharedClock;
use prepline_core::config::PredictorConfig;
use prepline_state::{FunctionId, HeatmapBucket};
use prepline_traffic::TrafficObserver;

use crate::forecast::{ForecastPoint, forecast};

pub struct PatternPredictor {
    observer: Arc<TrafficObserver>,
    config: PredictorConfig,
    clock: SharedClock,
    /// Predicted QPS at `horizon_minutes`, per function.
    horizon: ArcSwap<HashMap<FunctionId, f64>>,
}

impl PatternPredictor {
    pub fn new(observer: Arc<TrafficObserver>, config: PredictorConfig, clock: SharedClock) -> Self {
        Self {
            observer,
            config,
            clock,
            horizon: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Per-minute forecast for the next `horizon_minutes`.
    pub fn predict(&self, function_id: &str, horizon_minutes: u32) -> Vec<ForecastPoint> {
        let buckets = self.observer.historical_buckets(function_id);
        let recent = self
            .observer
            .recent_samples(function_id, self.config.trend_samples);
        forecast(
            &buckets,
            &recent,
            self.clock.now_ms(),
            horizon_minutes,
            &self.config,
        )
    }

    fn horizon_value(&self, function_id: &str) -> f64 {
        self.predict(function_id, self.config.horizon_minutes.max(1))
            .last()
            .map(|p| p.predicted_qps)
            .unwrap_or(0.0)
    }

    /// Recompute the horizon value of every known function and publish the
    /// new snapshot in one swap.
    pub fn refresh_all(&self) -> usize {
        let functions = self.observer.known_functions();
        let snapshot: HashMap<FunctionId, f64> = functions
            .into_iter()
            .map(|f| {
                let qps = self.horizon_value(&f);
                (f, qps)
            })
            .collect();
        let count = snapshot.len();
        self.horizon.store(Arc::new(snapshot));
        debug!(functions = count, "predictions refreshed");
        count
    }

    /// Latest published horizon prediction.
    pub fn predicted_at_horizon(&self, function_id: &str) -> Option<f64> {
        self.horizon.load().get(function_id).copied()
    }

    /// Dense 7×24 grid (Sunday first), zeros where no history exists.
    pub fn heatmap(&self, function_id: &str) -> Vec<HeatmapBucket> {
        let buckets = self.observer.historical_buckets(function_id);
        let mut grid = Vec::with_capacity(7 * 24);
        for day_of_week in 0..7u8 {
            for hour in 0..24u8 {
                grid.push(
                    buckets
                        .get(&(day_of_week, hour))
                        .cloned()
                        .unwrap_or(HeatmapBucket {
                            day_of_week,
                            hour,
                            avg_qps: 0.0,
                            avg_latency_ms: 0.0,
                            sample_count: 0,
                        }),
                );
            }
        }
        grid
    }

    /// Refresh on a fixed interval until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.refresh_interval.as_secs(),
            horizon_minutes = self.config.horizon_minutes,
            "pattern predictor started"
        );
        self.refresh_all();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval) => {
                    self.refresh_all();
                }
                _ = shutdown.changed() => {
                    info!("pattern predictor shutting down");
                    break;
                }
            }
        }
    }
}
