//! prepline-traffic — the Traffic Observer.
//!
//! Completion events enter through a cloneable [`TrafficRecorder`] that
//! never blocks the caller; a single ingest task drains the bounded channel
//! into per-function state:
//!
//! ```text
//!  complete() ──try_send──► mpsc ──► TrafficObserver::ingest
//!                                          │
//!                      ┌───────────────────┼────────────────────┐
//!                      ▼                   ▼                    ▼
//!               sliding window      minute roller          hour roller
//!               (current_stats)     (fine samples, 1h)     (coarse samples, 7d ──► redb)
//! ```
//!
//! Idle minutes and hours close as zero-QPS samples, so trend fitting and
//! the heatmap see silence rather than gaps.

pub mod calendar;
pub mod observer;
pub mod recorder;
pub mod roller;
pub mod synthetic;

pub use calendar::{DAY_MS, HOUR_MS, MINUTE_MS, slot_of};
pub use observer::TrafficObserver;
pub use recorder::{CompletionEvent, TrafficRecorder, recorder_channel};
pub use synthetic::SyntheticLoad;
