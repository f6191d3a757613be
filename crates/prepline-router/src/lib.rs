//! prepline-router — the placement engine.
//!
//! ```text
//!  place(request)
//!    │ admit ─────────── unknown function / error gate ──► FUNCTION_UNAVAILABLE
//!    │ select pool ───── preferred, then fallbacks ─────► NO_CAPACITY
//!    │ arbitrate ─────── saturated & not CRITICAL ──────► queue (or OVERLOADED)
//!    │ commit ────────── warm nodes, then most-free ────► PLACEMENT_TIMEOUT
//!    ▼
//!  RouterDecision ──► DecisionLog
//! ```
//!
//! Queued requests are admitted by [`Router::pump`], which runs on every
//! completion and on a fixed interval.

pub mod error;
pub mod queue;
pub mod router;

pub use error::{RouterError, RouterResult};
pub use prepline_state::{FunctionDirectory, StaticDirectory};
pub use queue::QueueTicket;
pub use router::{PlaceOutcome, Placement, PlacementRequest, Router, RouterDeps, RouterStats};
