//! prepline-sizer — the Warm-Pool Sizer.
//!
//! Turns observed and predicted QPS into a warm-container target per
//! (function, pool):
//!
//! ```text
//!  desired = ceil(max(current_qps, predicted_qps) / throughput(runtime)) + safety_margin
//! ```
//!
//! capped by the function's `max_warm`. Once a function has been idle for
//! longer than the cooldown, its target decays by one per tick instead.
//! Targets are published as an immutable [`WarmTargets`] snapshot swapped
//! atomically, so the router and pre-warm scheduler read a consistent map
//! without locking.

pub mod sizer;
pub mod targets;

pub use sizer::{SizingInputs, WarmPoolSizer, size};
pub use targets::WarmTargets;
