//! Day-of-week / hour-of-day bucketing.

use chrono::{DateTime, Datelike, Timelike};

pub const MINUTE_MS: u64 = 60_000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Heatmap slot of a UTC timestamp: (day of week with 0 = Sunday, hour).
pub fn slot_of(timestamp_ms: u64) -> (u8, u8) {
    match DateTime::from_timestamp_millis(timestamp_ms as i64) {
        Some(dt) => (dt.weekday().num_days_from_sunday() as u8, dt.hour() as u8),
        None => (0, 0),
    }
}

/// Start of the `width_ms` bucket containing `timestamp_ms`.
pub fn floor_to(timestamp_ms: u64, width_ms: u64) -> u64 {
    timestamp_ms - timestamp_ms % width_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_thursday_midnight() {
        assert_eq!(slot_of(0), (4, 0));
    }

    #[test]
    fn sunday_is_zero() {
        // 1970-01-04 was a Sunday.
        let sunday_10am = 3 * DAY_MS + 10 * HOUR_MS + 5 * MINUTE_MS;
        assert_eq!(slot_of(sunday_10am), (0, 10));
    }

    #[test]
    fn floors_to_bucket_start() {
        assert_eq!(floor_to(HOUR_MS + 59_999, MINUTE_MS), HOUR_MS);
        assert_eq!(floor_to(HOUR_MS + 59_999, HOUR_MS), HOUR_MS);
    }
}
