//! TrafficObserver — per-function sliding windows and sample history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use prepline_core::SharedClock;
use prepline_core::config::TrafficConfig;
use prepline_state::{FunctionId, FunctionStats, FunctionStatus, HeatmapBucket, StateStore, TrafficSample};

use crate::calendar::{HOUR_MS, MINUTE_MS, slot_of};
use crate::recorder::CompletionEvent;
use crate::roller::{Bucket, Roller};

#[derive(Debug, Clone, Copy)]
struct Completion {
    timestamp_ms: u64,
    latency_ms: f64,
    success: bool,
}

/// Everything observed for one function.
#[derive(Debug)]
struct FunctionTraffic {
    window: VecDeque<Completion>,
    minutes: Roller,
    hours: Roller,
    /// Per-minute samples, oldest first.
    fine: VecDeque<TrafficSample>,
    /// Per-hour samples, oldest first.
    coarse: VecDeque<TrafficSample>,
    last_activity_ms: Option<u64>,
}

impl FunctionTraffic {
    fn new(config: &TrafficConfig) -> Self {
        Self {
            window: VecDeque::new(),
            minutes: Roller::new(MINUTE_MS, config.fine_retention.as_millis() as u64),
            hours: Roller::new(HOUR_MS, config.coarse_retention.as_millis() as u64),
            fine: VecDeque::new(),
            coarse: VecDeque::new(),
            last_activity_ms: None,
        }
    }

    fn prune(&mut self, now_ms: u64, config: &TrafficConfig) {
        let window_start = now_ms.saturating_sub(config.window.as_millis() as u64);
        while self.window.front().is_some_and(|c| c.timestamp_ms <= window_start) {
            self.window.pop_front();
        }
        let fine_start = now_ms.saturating_sub(config.fine_retention.as_millis() as u64);
        while self.fine.front().is_some_and(|s| s.timestamp_ms < fine_start) {
            self.fine.pop_front();
        }
        let coarse_start = now_ms.saturating_sub(config.coarse_retention.as_millis() as u64);
        while self.coarse.front().is_some_and(|s| s.timestamp_ms < coarse_start) {
            self.coarse.pop_front();
        }
    }
}

fn to_sample(function_id: &str, bucket: &Bucket, width_ms: u64) -> TrafficSample {
    TrafficSample {
        function_id: function_id.to_string(),
        timestamp_ms: bucket.start_ms,
        qps: bucket.count as f64 / (width_ms as f64 / 1000.0),
        avg_latency_ms: bucket.avg_latency_ms(),
        error_rate: bucket.error_rate(),
        count: bucket.count,
    }
}

/// Nearest-rank 99th percentile of a set of latencies; 0 when empty.
fn p99(latencies: &mut [f64]) -> f64 {
    if latencies.is_empty() {
        return 0.0;
    }
    latencies.sort_unstable_by(f64::total_cmp);
    let rank = (latencies.len() * 99).div_ceil(100);
    latencies[rank.clamp(1, latencies.len()) - 1]
}

/// Aggregates completion events into real-time stats and historical samples.
pub struct TrafficObserver {
    functions: DashMap<FunctionId, Arc<Mutex<FunctionTraffic>>>,
    config: TrafficConfig,
    clock: SharedClock,
    store: Option<StateStore>,
    /// Coarse samples closed but not yet written to the store.
    pending: Mutex<Vec<TrafficSample>>,
}

impl TrafficObserver {
    pub fn new(config: TrafficConfig, clock: SharedClock) -> Self {
        Self {
            functions: DashMap::new(),
            config,
            clock,
            store: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Persist closed hourly samples to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    fn entry(&self, function_id: &str) -> Arc<Mutex<FunctionTraffic>> {
        if let Some(existing) = self.functions.get(function_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.functions
                .entry(function_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(FunctionTraffic::new(&self.config))))
                .value(),
        )
    }

    fn existing(&self, function_id: &str) -> Option<Arc<Mutex<FunctionTraffic>>> {
        self.functions.get(function_id).map(|e| Arc::clone(e.value()))
    }

    /// Apply one completion event.
    pub fn ingest(&self, event: CompletionEvent) {
        let traffic = self.entry(&event.function_id);
        let mut t = traffic.lock();
        let mut minutes = Vec::new();
        let mut hours = Vec::new();

        t.window.push_back(Completion {
            timestamp_ms: event.timestamp_ms,
            latency_ms: event.latency_ms,
            success: event.success,
        });
        t.minutes
            .add(event.timestamp_ms, event.latency_ms, event.success, &mut minutes);
        t.hours
            .add(event.timestamp_ms, event.latency_ms, event.success, &mut hours);
        t.last_activity_ms = Some(t.last_activity_ms.map_or(event.timestamp_ms, |l| l.max(event.timestamp_ms)));

        self.absorb(&event.function_id, &mut t, &minutes, &hours);
        let now = self.clock.now_ms().max(event.timestamp_ms);
        t.prune(now, &self.config);
    }

    fn absorb(&self, function_id: &str, t: &mut FunctionTraffic, minutes: &[Bucket], hours: &[Bucket]) {
        t.fine
            .extend(minutes.iter().map(|b| to_sample(function_id, b, MINUTE_MS)));
        if hours.is_empty() {
            return;
        }
        let closed: Vec<TrafficSample> = hours
            .iter()
            .map(|b| to_sample(function_id, b, HOUR_MS))
            .collect();
        t.coarse.extend(closed.iter().cloned());
        if self.store.is_some() {
            self.pending.lock().extend(closed);
        }
    }

    /// Close every elapsed minute and hour bucket, idle ones included.
    ///
    /// Returns how many hourly samples were closed.
    pub fn flush(&self, now_ms: u64) -> usize {
        let mut closed_hours = 0;
        for (function_id, traffic) in self.snapshot_entries() {
            let mut t = traffic.lock();
            let mut minutes = Vec::new();
            let mut hours = Vec::new();
            t.minutes.flush(now_ms, &mut minutes);
            t.hours.flush(now_ms, &mut hours);
            closed_hours += hours.len();
            self.absorb(&function_id, &mut t, &minutes, &hours);
            t.prune(now_ms, &self.config);
        }
        closed_hours
    }

    fn snapshot_entries(&self) -> Vec<(FunctionId, Arc<Mutex<FunctionTraffic>>)> {
        self.functions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Write pending hourly samples and prune expired ones from the store.
    pub fn persist(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let batch = std::mem::take(&mut *self.pending.lock());
        store.put_samples(&batch)?;
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.config.coarse_retention.as_millis() as u64);
        let pruned = store.prune_samples(cutoff)?;
        if !batch.is_empty() || pruned > 0 {
            debug!(written = batch.len(), pruned, "traffic history persisted");
        }
        Ok(batch.len())
    }

    /// Reload hourly history from the store, bounded to the coarse retention.
    pub fn load_history(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let since = self
            .clock
            .now_ms()
            .saturating_sub(self.config.coarse_retention.as_millis() as u64);
        let samples = store.list_all_samples(since)?;
        let count = samples.len();
        self.import_history(samples);
        info!(samples = count, "traffic history loaded");
        Ok(count)
    }

    /// Seed hourly history (from the store, or a synthetic generator).
    ///
    /// Samples at or before a function's newest known hour are ignored.
    pub fn import_history(&self, samples: Vec<TrafficSample>) {
        let mut by_function: BTreeMap<FunctionId, Vec<TrafficSample>> = BTreeMap::new();
        for sample in samples {
            by_function
                .entry(sample.function_id.clone())
                .or_default()
                .push(sample);
        }
        for (function_id, mut samples) in by_function {
            samples.sort_by_key(|s| s.timestamp_ms);
            let traffic = self.entry(&function_id);
            let mut t = traffic.lock();
            for sample in samples {
                if t.coarse.back().is_some_and(|last| last.timestamp_ms >= sample.timestamp_ms) {
                    continue;
                }
                t.hours.resume_at(sample.timestamp_ms + HOUR_MS);
                t.coarse.push_back(sample);
            }
            let now = self.clock.now_ms();
            t.prune(now, &self.config);
        }
    }

    /// Sliding-window statistics; zeros when nothing recent was observed.
    pub fn current_stats(&self, function_id: &str) -> FunctionStats {
        let Some(traffic) = self.existing(function_id) else {
            return FunctionStats::default();
        };
        let now = self.clock.now_ms();
        let window_ms = self.config.window.as_millis() as u64;
        let window_start = now.saturating_sub(window_ms);

        let t = traffic.lock();
        let recent: Vec<&Completion> = t
            .window
            .iter()
            .filter(|c| c.timestamp_ms > window_start)
            .collect();
        if recent.is_empty() {
            return FunctionStats::default();
        }

        let requests = recent.len() as u64;
        let errors = recent.iter().filter(|c| !c.success).count() as u64;
        let mut latencies: Vec<f64> = recent.iter().map(|c| c.latency_ms).collect();
        let avg_latency_ms = latencies.iter().sum::<f64>() / requests as f64;
        FunctionStats {
            qps: requests as f64 / (window_ms as f64 / 1000.0),
            avg_latency_ms,
            p99_latency_ms: p99(&mut latencies),
            error_rate: errors as f64 / requests as f64,
            requests,
        }
    }

    /// Classify current traffic.
    pub fn status(&self, function_id: &str) -> FunctionStatus {
        let stats = self.current_stats(function_id);
        if stats.requests == 0 {
            FunctionStatus::Cold
        } else if stats.error_rate >= self.config.error_prone_rate {
            FunctionStatus::ErrorProne
        } else if stats.qps >= self.config.hot_qps {
            FunctionStatus::Hot
        } else {
            FunctionStatus::Stable
        }
    }

    /// Average traffic per (day-of-week, hour) slot. Slots without samples
    /// are absent and read as zero.
    pub fn historical_buckets(&self, function_id: &str) -> HashMap<(u8, u8), HeatmapBucket> {
        let mut buckets: HashMap<(u8, u8), HeatmapBucket> = HashMap::new();
        let Some(traffic) = self.existing(function_id) else {
            return buckets;
        };
        // (qps sum, latency sum, samples with traffic)
        let mut sums: HashMap<(u8, u8), (f64, f64, u32, u32)> = HashMap::new();
        for sample in traffic.lock().coarse.iter() {
            let slot = slot_of(sample.timestamp_ms);
            let entry = sums.entry(slot).or_default();
            entry.0 += sample.qps;
            entry.3 += 1;
            if sample.count > 0 {
                entry.1 += sample.avg_latency_ms;
                entry.2 += 1;
            }
        }
        for ((day_of_week, hour), (qps_sum, latency_sum, with_traffic, samples)) in sums {
            buckets.insert(
                (day_of_week, hour),
                HeatmapBucket {
                    day_of_week,
                    hour,
                    avg_qps: qps_sum / f64::from(samples),
                    avg_latency_ms: if with_traffic == 0 {
                        0.0
                    } else {
                        latency_sum / f64::from(with_traffic)
                    },
                    sample_count: samples,
                },
            );
        }
        buckets
    }

    /// The newest `n` per-minute samples, oldest first.
    pub fn recent_samples(&self, function_id: &str, n: usize) -> Vec<TrafficSample> {
        let Some(traffic) = self.existing(function_id) else {
            return Vec::new();
        };
        let t = traffic.lock();
        let skip = t.fine.len().saturating_sub(n);
        t.fine.iter().skip(skip).cloned().collect()
    }

    /// Per-minute samples starting at or after `since_ms`.
    pub fn fine_samples_since(&self, function_id: &str, since_ms: u64) -> Vec<TrafficSample> {
        let Some(traffic) = self.existing(function_id) else {
            return Vec::new();
        };
        let t = traffic.lock();
        t.fine
            .iter()
            .filter(|s| s.timestamp_ms >= since_ms)
            .cloned()
            .collect()
    }

    /// Timestamp of the newest completion ever observed.
    pub fn last_activity_ms(&self, function_id: &str) -> Option<u64> {
        self.existing(function_id)
            .and_then(|t| t.lock().last_activity_ms)
    }

    /// Every function with observed traffic or imported history, sorted.
    pub fn known_functions(&self) -> Vec<FunctionId> {
        let mut ids: Vec<FunctionId> = self.functions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Ingest completions and close buckets until shutdown.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<CompletionEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let interval: Duration = self.config.flush_interval;
        info!(
            flush_interval_ms = interval.as_millis() as u64,
            "traffic observer started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.ingest(event),
                    None => {
                        info!("completion channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(self.clock.now_ms());
                    if let Err(e) = self.persist() {
                        warn!(error = %e, "traffic history persist failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("traffic observer shutting down");
                    while let Ok(event) = events.try_recv() {
                        self.ingest(event);
                    }
                    break;
                }
            }
        }

        self.flush(self.clock.now_ms());
        if let Err(e) = self.persist() {
            warn!(error = %e, "final traffic persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepline_core::{Clock, ManualClock};

    const START: u64 = 1_700_000_000_000 - 1_700_000_000_000 % HOUR_MS;

    fn observer() -> (TrafficObserver, Arc<ManualClock>) {
        let clock = ManualClock::new(START);
        let shared: SharedClock = clock.clone();
        (TrafficObserver::new(TrafficConfig::default(), shared), clock)
    }

    fn event(function_id: &str, ts: u64, latency_ms: f64, success: bool) -> CompletionEvent {
        CompletionEvent {
            function_id: function_id.to_string(),
            latency_ms,
            success,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn unknown_function_reads_zero() {
        let (obs, _) = observer();
        assert_eq!(obs.current_stats("nope"), FunctionStats::default());
        assert_eq!(obs.status("nope"), FunctionStatus::Cold);
        assert!(obs.historical_buckets("nope").is_empty());
        assert!(obs.last_activity_ms("nope").is_none());
    }

    #[test]
    fn p99_is_nearest_rank() {
        let mut hundred: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(p99(&mut hundred), 99.0);
        let mut one = vec![7.0];
        assert_eq!(p99(&mut one), 7.0);
        let mut few = vec![3.0, 1.0, 2.0];
        assert_eq!(p99(&mut few), 3.0);
        assert_eq!(p99(&mut []), 0.0);
    }

    #[test]
    fn window_stats() {
        let (obs, clock) = observer();
        for i in 0..120u64 {
            let success = i % 10 != 0;
            obs.ingest(event("f1", START + i * 250, (i % 100) as f64 + 1.0, success));
        }
        clock.set(START + 30_000);

        let stats = obs.current_stats("f1");
        assert_eq!(stats.requests, 120);
        assert!((stats.qps - 2.0).abs() < 1e-9);
        assert!((stats.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(stats.p99_latency_ms, 99.0);
        assert_eq!(obs.status("f1"), FunctionStatus::ErrorProne);

        clock.set(START + 120_000);
        assert_eq!(obs.current_stats("f1").requests, 0);
        assert_eq!(obs.status("f1"), FunctionStatus::Cold);
    }

    #[test]
    fn hot_and_stable_classes() {
        let (obs, clock) = observer();
        for i in 0..900u64 {
            obs.ingest(event("hot", START + i * 60, 5.0, true));
        }
        obs.ingest(event("calm", START, 5.0, true));
        clock.set(START + 54_000);
        assert_eq!(obs.status("hot"), FunctionStatus::Hot);
        assert_eq!(obs.status("calm"), FunctionStatus::Stable);
    }

    #[test]
    fn flush_emits_zero_minutes_for_silence() {
        let (obs, clock) = observer();
        for i in 0..60u64 {
            obs.ingest(event("f1", START + i * 1000, 10.0, true));
        }
        clock.set(START + 5 * MINUTE_MS);
        obs.flush(clock.now_ms());

        let samples = obs.recent_samples("f1", 10);
        let qps: Vec<f64> = samples.iter().map(|s| s.qps).collect();
        assert_eq!(qps, vec![1.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(obs.recent_samples("f1", 2).len(), 2);
        assert_eq!(obs.fine_samples_since("f1", START + 3 * MINUTE_MS).len(), 2);
        assert_eq!(obs.last_activity_ms("f1"), Some(START + 59_000));
    }

    #[test]
    fn hourly_samples_feed_heatmap() {
        let (obs, clock) = observer();
        for i in 0..360u64 {
            obs.ingest(event("f1", START + i * 10_000, 20.0, true));
        }
        clock.set(START + 2 * HOUR_MS);
        assert_eq!(obs.flush(clock.now_ms()), 2);

        let buckets = obs.historical_buckets("f1");
        let (dow, hour) = slot_of(START);
        let busy = &buckets[&(dow, hour)];
        assert_eq!(busy.sample_count, 1);
        assert!((busy.avg_qps - 0.1).abs() < 1e-9);
        assert_eq!(busy.avg_latency_ms, 20.0);

        let idle = &buckets[&slot_of(START + HOUR_MS)];
        assert_eq!(idle.avg_qps, 0.0);
        assert_eq!(idle.avg_latency_ms, 0.0);
    }

    #[test]
    fn history_round_trips_through_store() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(START);
        let shared: SharedClock = clock.clone();
        let obs = TrafficObserver::new(TrafficConfig::default(), shared.clone()).with_store(store.clone());

        obs.ingest(event("f1", START + 1_000, 5.0, true));
        clock.set(START + HOUR_MS);
        obs.flush(clock.now_ms());
        assert_eq!(obs.persist().unwrap(), 1);

        let reloaded = TrafficObserver::new(TrafficConfig::default(), shared).with_store(store);
        assert_eq!(reloaded.load_history().unwrap(), 1);
        assert_eq!(reloaded.known_functions(), vec!["f1"]);
        assert_eq!(reloaded.historical_buckets("f1").len(), 1);

        // The reloaded hour is not re-emitted by later traffic.
        reloaded.ingest(event("f1", START + HOUR_MS + 5, 5.0, true));
        clock.set(START + 2 * HOUR_MS);
        assert_eq!(reloaded.flush(clock.now_ms()), 1);
        assert_eq!(reloaded.historical_buckets("f1").len(), 2);
    }

    #[test]
    fn import_skips_duplicates_and_old_samples() {
        let (obs, _) = observer();
        let sample = |ts: u64| TrafficSample {
            function_id: "f1".to_string(),
            timestamp_ms: ts,
            qps: 1.0,
            avg_latency_ms: 1.0,
            error_rate: 0.0,
            count: 3600,
        };
        obs.import_history(vec![
            sample(START - HOUR_MS),
            sample(START - HOUR_MS),
            sample(START - 30 * 24 * HOUR_MS),
        ]);
        let total: u32 = obs
            .historical_buckets("f1")
            .values()
            .map(|b| b.sample_count)
            .sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn run_loop_ingests_until_shutdown() {
        let (obs, _) = observer();
        let obs = Arc::new(obs);
        let (recorder, rx) = crate::recorder_channel(16);
        let (tx, shutdown) = tokio::sync::watch::channel(false);

        let handle = {
            let obs = Arc::clone(&obs);
            tokio::spawn(async move { obs.run(rx, shutdown).await })
        };
        recorder.record_completion("f1", 12.0, true, START);
        recorder.record_completion("f1", 14.0, true, START + 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(obs.current_stats("f1").requests, 2);
    }
}
