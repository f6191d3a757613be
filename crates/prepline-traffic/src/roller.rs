//! Fixed-width aggregation buckets that close in time order.

use crate::calendar::floor_to;

/// An aggregation bucket, open or closed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    pub start_ms: u64,
    pub count: u64,
    pub errors: u64,
    pub latency_sum_ms: f64,
}

impl Bucket {
    fn empty(start_ms: u64) -> Self {
        Self {
            start_ms,
            ..Self::default()
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.count as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.errors as f64 / self.count as f64
        }
    }
}

/// Rolls events into consecutive buckets of `width_ms`.
///
/// Every bucket from the first event onwards is emitted exactly once when
/// it closes, empty ones included. Gaps longer than `retain_ms` are skipped
/// since those buckets would be pruned immediately anyway.
#[derive(Debug)]
pub struct Roller {
    width_ms: u64,
    retain_ms: u64,
    /// Start of the oldest bucket not yet emitted.
    next_start: Option<u64>,
    open: Option<Bucket>,
}

impl Roller {
    pub fn new(width_ms: u64, retain_ms: u64) -> Self {
        Self {
            width_ms,
            retain_ms: retain_ms.max(width_ms),
            next_start: None,
            open: None,
        }
    }

    /// Add one event, emitting any buckets that closed before it.
    ///
    /// Events older than the oldest unemitted bucket count towards it.
    pub fn add(&mut self, timestamp_ms: u64, latency_ms: f64, success: bool, out: &mut Vec<Bucket>) {
        let start = floor_to(timestamp_ms, self.width_ms);
        let start = match self.next_start {
            Some(next) => start.max(next),
            None => {
                self.next_start = Some(start);
                start
            }
        };
        self.close_until(start, out);

        let bucket = self.open.get_or_insert_with(|| Bucket::empty(start));
        bucket.count += 1;
        bucket.latency_sum_ms += latency_ms;
        if !success {
            bucket.errors += 1;
        }
    }

    /// Emit every bucket that ends at or before `now_ms`.
    pub fn flush(&mut self, now_ms: u64, out: &mut Vec<Bucket>) {
        self.close_until(floor_to(now_ms, self.width_ms), out);
    }

    /// Mark everything before `start_ms` as already emitted.
    pub fn resume_at(&mut self, start_ms: u64) {
        let start = floor_to(start_ms, self.width_ms);
        if self.next_start.is_none_or(|next| next < start) {
            self.next_start = Some(start);
            if self.open.is_some_and(|b| b.start_ms < start) {
                self.open = None;
            }
        }
    }

    fn close_until(&mut self, limit: u64, out: &mut Vec<Bucket>) {
        let Some(mut next) = self.next_start else {
            return;
        };
        if limit > next + self.retain_ms {
            next = floor_to(limit - self.retain_ms, self.width_ms);
            if self.open.is_some_and(|b| b.start_ms < next) {
                self.open = None;
            }
        }
        while next < limit {
            match self.open {
                Some(bucket) if bucket.start_ms == next => {
                    out.push(bucket);
                    self.open = None;
                }
                _ => out.push(Bucket::empty(next)),
            }
            next += self.width_ms;
        }
        self.next_start = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{HOUR_MS, MINUTE_MS};

    #[test]
    fn nothing_before_first_event() {
        let mut roller = Roller::new(MINUTE_MS, HOUR_MS);
        let mut out = Vec::new();
        roller.flush(10 * MINUTE_MS, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn closes_buckets_and_fills_gaps() {
        let mut roller = Roller::new(MINUTE_MS, HOUR_MS);
        let mut out = Vec::new();
        roller.add(1_000, 10.0, true, &mut out);
        roller.add(2_000, 30.0, false, &mut out);
        assert!(out.is_empty());

        roller.add(3 * MINUTE_MS + 5, 5.0, true, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].count, 2);
        assert_eq!(out[0].avg_latency_ms(), 20.0);
        assert_eq!(out[0].error_rate(), 0.5);
        assert_eq!(out[1].count, 0);
        assert_eq!(out[2].start_ms, 2 * MINUTE_MS);

        out.clear();
        roller.flush(4 * MINUTE_MS, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].count, 1);
    }

    #[test]
    fn long_gaps_are_bounded_by_retention() {
        let mut roller = Roller::new(MINUTE_MS, HOUR_MS);
        let mut out = Vec::new();
        roller.add(0, 1.0, true, &mut out);
        roller.flush(10 * HOUR_MS, &mut out);
        assert_eq!(out.len(), 60);
        assert_eq!(out.last().unwrap().start_ms, 10 * HOUR_MS - MINUTE_MS);
    }

    #[test]
    fn late_events_fold_into_open_bucket() {
        let mut roller = Roller::new(MINUTE_MS, HOUR_MS);
        let mut out = Vec::new();
        roller.add(2 * MINUTE_MS, 1.0, true, &mut out);
        roller.flush(3 * MINUTE_MS, &mut out);
        roller.add(MINUTE_MS, 1.0, true, &mut out);
        roller.flush(4 * MINUTE_MS, &mut out);
        let counts: Vec<u64> = out.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn resume_skips_already_persisted_buckets() {
        let mut roller = Roller::new(HOUR_MS, 7 * 24 * HOUR_MS);
        roller.resume_at(5 * HOUR_MS);
        let mut out = Vec::new();
        roller.add(4 * HOUR_MS, 1.0, true, &mut out);
        roller.flush(6 * HOUR_MS, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_ms, 5 * HOUR_MS);
    }
}
