//! prepline-registry — the authoritative view of worker nodes.
//!
//! Each node lives in its own `parking_lot::Mutex` inside a `DashMap`, so
//! heartbeats, reservations, and warm adjustments on different nodes never
//! contend. There is no background expiry timer: staleness is evaluated
//! against the injected clock on every read.
//!
//! ```text
//!  heartbeat ──► NodeRecord ◄── try_reserve / release   (router)
//!                    ▲
//!                    └──────── apply_warm_delta         (pre-warm scheduler)
//! ```

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{NodeRegistry, PoolLoad, Reservation, capacity_order};
