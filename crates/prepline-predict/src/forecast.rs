//! Pure forecasting math.

use std::collections::HashMap;

use prepline_core::config::PredictorConfig;
use prepline_state::{HeatmapBucket, TrafficSample};
use prepline_traffic::{MINUTE_MS, slot_of};

/// One predicted minute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastPoint {
    pub timestamp_ms: u64,
    pub predicted_qps: f64,
}

/// Least-squares line through `(minutes relative to the last sample, qps)`.
///
/// Returns `(slope per minute, value at the last sample)`. A single sample
/// yields a flat line; none yields `None`.
pub fn linear_trend(samples: &[TrafficSample]) -> Option<(f64, f64)> {
    let last = samples.last()?;
    if samples.len() == 1 {
        return Some((0.0, last.qps));
    }
    let xs: Vec<f64> = samples
        .iter()
        .map(|s| (s.timestamp_ms as f64 - last.timestamp_ms as f64) / MINUTE_MS as f64)
        .collect();
    let n = samples.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = samples.iter().map(|s| s.qps).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (x, s) in xs.iter().zip(samples) {
        cov += (x - mean_x) * (s.qps - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    if var == 0.0 {
        return Some((0.0, mean_y));
    }
    let slope = cov / var;
    // Intercept at x = 0, the last sample.
    Some((slope, mean_y - slope * mean_x))
}

/// Forecast `horizon_minutes` future minutes after `now_ms`.
///
/// Minute k blends the seasonal bucket with weight `min(1, k / blend)` and
/// the trend with the remainder. A slot without samples contributes no
/// weight; with no recent samples only the seasonal value is used.
pub fn forecast(
    buckets: &HashMap<(u8, u8), HeatmapBucket>,
    recent: &[TrafficSample],
    now_ms: u64,
    horizon_minutes: u32,
    config: &PredictorConfig,
) -> Vec<ForecastPoint> {
    let take = config.trend_samples.max(1);
    let window = &recent[recent.len().saturating_sub(take)..];
    let trend = linear_trend(window);
    let anchor_ms = window.last().map(|s| s.timestamp_ms);
    let base_ms = now_ms - now_ms % MINUTE_MS;
    let blend = f64::from(config.blend_horizon_minutes.max(1));

    (1..=horizon_minutes)
        .map(|k| {
            let timestamp_ms = base_ms + u64::from(k) * MINUTE_MS;
            let seasonal = buckets
                .get(&slot_of(timestamp_ms))
                .filter(|b| b.sample_count > 0)
                .map(|b| b.avg_qps);

            let predicted = match (trend, anchor_ms) {
                (Some((slope, intercept)), Some(anchor)) => {
                    let x = (timestamp_ms as f64 - anchor as f64) / MINUTE_MS as f64;
                    let trend_qps = intercept + slope * x;
                    match seasonal {
                        Some(hist) => {
                            let w = (f64::from(k) / blend).min(1.0);
                            w * hist + (1.0 - w) * trend_qps
                        }
                        None => trend_qps,
                    }
                }
                _ => seasonal.unwrap_or(0.0),
            };

            ForecastPoint {
                timestamp_ms,
                predicted_qps: predicted.max(0.0),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepline_traffic::HOUR_MS;

    // 2024-01-01 00:00 UTC, a Monday.
    const MONDAY: u64 = 1_704_067_200_000;

    fn fine(ts: u64, qps: f64) -> TrafficSample {
        TrafficSample {
            function_id: "f".to_string(),
            timestamp_ms: ts,
            qps,
            avg_latency_ms: 0.0,
            error_rate: 0.0,
            count: (qps * 60.0) as u64,
        }
    }

    fn rising(n: u64, end_ms: u64) -> Vec<TrafficSample> {
        (0..n)
            .map(|i| fine(end_ms - (n - 1 - i) * MINUTE_MS, i as f64))
            .collect()
    }

    fn flat_buckets(qps: f64) -> HashMap<(u8, u8), HeatmapBucket> {
        let mut buckets = HashMap::new();
        for day in 0..7u8 {
            for hour in 0..24u8 {
                buckets.insert(
                    (day, hour),
                    HeatmapBucket {
                        day_of_week: day,
                        hour,
                        avg_qps: qps,
                        avg_latency_ms: 0.0,
                        sample_count: 1,
                    },
                );
            }
        }
        buckets
    }

    #[test]
    fn trend_of_a_line_is_exact() {
        let samples = rising(10, MONDAY);
        let (slope, intercept) = linear_trend(&samples).unwrap();
        assert!((slope - 1.0).abs() < 1e-9);
        assert!((intercept - 9.0).abs() < 1e-9);
        assert_eq!(linear_trend(&[]), None);
        assert_eq!(linear_trend(&samples[..1]), Some((0.0, 0.0)));
    }

    #[test]
    fn no_history_follows_trend() {
        let now = MONDAY + 10 * HOUR_MS;
        let points = forecast(&HashMap::new(), &rising(10, now - MINUTE_MS), now, 3, &PredictorConfig::default());
        let qps: Vec<f64> = points.iter().map(|p| p.predicted_qps).collect();
        assert_eq!(qps.len(), 3);
        assert!((qps[0] - 11.0).abs() < 1e-9);
        assert!((qps[2] - 13.0).abs() < 1e-9);
    }

    #[test]
    fn no_recent_samples_uses_history_only() {
        let now = MONDAY;
        let points = forecast(&flat_buckets(7.0), &[], now, 5, &PredictorConfig::default());
        assert!(points.iter().all(|p| p.predicted_qps == 7.0));
        let empty = forecast(&HashMap::new(), &[], now, 2, &PredictorConfig::default());
        assert!(empty.iter().all(|p| p.predicted_qps == 0.0));
    }

    #[test]
    fn blend_moves_towards_history() {
        let now = MONDAY;
        let recent: Vec<TrafficSample> = (0..10).map(|i| fine(now - i * MINUTE_MS, 20.0)).rev().collect();
        let points = forecast(&flat_buckets(10.0), &recent, now, 45, &PredictorConfig::default());
        // k = 15 of a 30-minute blend: half and half.
        assert!((points[14].predicted_qps - 15.0).abs() < 1e-9);
        assert!((points[29].predicted_qps - 10.0).abs() < 1e-9);
        assert!((points[44].predicted_qps - 10.0).abs() < 1e-9);
    }

    #[test]
    fn falling_trend_clamps_at_zero() {
        let now = MONDAY;
        let falling: Vec<TrafficSample> = (0..10u64)
            .map(|i| fine(now - (9 - i) * MINUTE_MS, 9.0 - i as f64))
            .collect();
        let points = forecast(&HashMap::new(), &falling, now, 10, &PredictorConfig::default());
        assert!(points.iter().all(|p| p.predicted_qps >= 0.0));
        assert_eq!(points[9].predicted_qps, 0.0);
    }

    #[test]
    fn identical_inputs_identical_output() {
        let now = MONDAY + 3 * HOUR_MS;
        let recent = rising(10, now);
        let buckets = flat_buckets(4.0);
        let config = PredictorConfig::default();
        let a = forecast(&buckets, &recent, now, 30, &config);
        let b = forecast(&buckets, &recent, now, 30, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn only_the_configured_number_of_samples_shape_the_trend() {
        let now = MONDAY;
        let mut recent: Vec<TrafficSample> = (0..5).map(|i| fine(now - (14 - i) * MINUTE_MS, 100.0)).collect();
        recent.extend((5..15).map(|i| fine(now - (14 - i) * MINUTE_MS, 2.0)));
        let points = forecast(&HashMap::new(), &recent, now, 1, &PredictorConfig::default());
        assert!((points[0].predicted_qps - 2.0).abs() < 1e-9);
    }
}
