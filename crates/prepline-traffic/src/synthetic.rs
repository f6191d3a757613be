//! Deterministic seasonal traffic for tests and demo mode.
//!
//! Weekday office hours carry the base load, weekday evenings peak, nights
//! fall to a trough, and weekends run at half rate. Jitter comes from a hash
//! of the function id and the timestamp, so the same inputs always produce
//! the same traffic.

use chrono::{DateTime, Datelike, Timelike, Weekday};

use prepline_state::TrafficSample;

use crate::calendar::{HOUR_MS, MINUTE_MS, floor_to};
use crate::recorder::CompletionEvent;

#[derive(Debug, Clone)]
pub struct SyntheticLoad {
    /// QPS during weekday office hours.
    pub base_qps: f64,
    pub base_latency_ms: f64,
    pub error_rate: f64,
    /// Relative amplitude of the jitter, e.g. 0.1 for ±10%.
    pub jitter: f64,
}

impl Default for SyntheticLoad {
    fn default() -> Self {
        Self {
            base_qps: 10.0,
            base_latency_ms: 120.0,
            error_rate: 0.01,
            jitter: 0.1,
        }
    }
}

/// FNV-1a over the function id and a timestamp, scaled to [0, 1).
fn unit_hash(function_id: &str, salt: u64) -> f64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in function_id.bytes().chain(salt.to_le_bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

impl SyntheticLoad {
    pub fn new(base_qps: f64) -> Self {
        Self {
            base_qps,
            ..Self::default()
        }
    }

    /// Seasonal multiplier for a timestamp.
    pub fn seasonal_factor(timestamp_ms: u64) -> f64 {
        let Some(dt) = DateTime::from_timestamp_millis(timestamp_ms as i64) else {
            return 1.0;
        };
        let daily = match dt.hour() {
            0..=5 => 0.2,
            6..=8 => 0.6,
            9..=17 => 1.0,
            18..=21 => 1.4,
            _ => 0.5,
        };
        match dt.weekday() {
            Weekday::Sat | Weekday::Sun => daily * 0.5,
            _ => daily,
        }
    }

    /// Expected QPS for a function at a given minute.
    pub fn qps_at(&self, function_id: &str, timestamp_ms: u64) -> f64 {
        let minute = floor_to(timestamp_ms, MINUTE_MS);
        let noise = 1.0 + self.jitter * (2.0 * unit_hash(function_id, minute) - 1.0);
        (self.base_qps * Self::seasonal_factor(minute) * noise).max(0.0)
    }

    fn sample(&self, function_id: &str, start_ms: u64, width_ms: u64) -> TrafficSample {
        let qps = self.qps_at(function_id, start_ms);
        let latency_noise = 1.0 + self.jitter * (2.0 * unit_hash(function_id, start_ms ^ 0x5a5a) - 1.0);
        TrafficSample {
            function_id: function_id.to_string(),
            timestamp_ms: start_ms,
            qps,
            avg_latency_ms: self.base_latency_ms * latency_noise,
            error_rate: self.error_rate,
            count: (qps * width_ms as f64 / 1000.0).round() as u64,
        }
    }

    /// One hourly sample per hour in `[from_ms, to_ms)`.
    pub fn hourly_samples(&self, function_id: &str, from_ms: u64, to_ms: u64) -> Vec<TrafficSample> {
        let mut samples = Vec::new();
        let mut start = floor_to(from_ms, HOUR_MS);
        while start < to_ms {
            samples.push(self.sample(function_id, start, HOUR_MS));
            start += HOUR_MS;
        }
        samples
    }

    /// One per-minute sample per minute in `[from_ms, to_ms)`.
    pub fn minute_samples(&self, function_id: &str, from_ms: u64, to_ms: u64) -> Vec<TrafficSample> {
        let mut samples = Vec::new();
        let mut start = floor_to(from_ms, MINUTE_MS);
        while start < to_ms {
            samples.push(self.sample(function_id, start, MINUTE_MS));
            start += MINUTE_MS;
        }
        samples
    }

    /// Completion events for `[from_ms, to_ms)`, evenly spaced within each
    /// minute at that minute's rate.
    pub fn events(&self, function_id: &str, from_ms: u64, to_ms: u64) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        for sample in self.minute_samples(function_id, from_ms, to_ms) {
            if sample.count == 0 {
                continue;
            }
            let spacing = MINUTE_MS / sample.count;
            for i in 0..sample.count {
                let ts = sample.timestamp_ms + i * spacing;
                if ts < from_ms || ts >= to_ms {
                    continue;
                }
                let roll = unit_hash(function_id, ts);
                events.push(CompletionEvent {
                    function_id: function_id.to_string(),
                    latency_ms: sample.avg_latency_ms * (0.5 + roll),
                    success: roll >= self.error_rate,
                    timestamp_ms: ts,
                });
            }
        }
        events
    }
}
