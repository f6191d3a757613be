//! prepline-core — shared vocabulary for the Prepline router.
//!
//! Holds the closed enumerations every other crate matches on (pools,
//! priorities, runtimes, execution modes), the externally-owned
//! `FunctionProfile`, the `prepline.toml` configuration tree, and the
//! injectable clock used to keep time-dependent logic deterministic in
//! tests.

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::PreplineConfig;
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
