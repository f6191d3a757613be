//! prepline-decisions — the Decision Log.
//!
//! One shard per function, each a mutex-guarded pair of bounded deques
//! (placements and scale actions), plus a global sequence counter. An
//! append only ever locks its own function's shard.
//!
//! When persistence is enabled, every appended record is also forwarded
//! over an unbounded channel to a [`DecisionPersister`] task that batches
//! writes into the redb `decisions` table. Placement never waits on disk.

pub mod log;
pub mod persister;

pub use log::DecisionLog;
pub use persister::DecisionPersister;
