//! prepline-prewarm — the Pre-warm Scheduler.
//!
//! Each tick compares the sizer's published targets with the warm
//! containers the registry reports and issues single-container commands:
//!
//! ```text
//!  WarmTargets ──┐
//!                ├─► plan (rate-limited) ─► apply delta ─► NodeAgent ─► node
//!  NodeRegistry ─┘                              │  fail twice
//!                                               └─► revert, defer, count failure
//! ```
//!
//! Scale-down waits for the surplus to outlast a grace period and drains
//! the least recently used containers first.

pub mod agent;
pub mod error;
pub mod plan;
pub mod scheduler;

pub use agent::{AgentFuture, ChannelAgent, NodeAgent};
pub use error::{PrewarmError, PrewarmResult};
pub use scheduler::{PrewarmScheduler, TickReport};
