//! prepline-state — domain records and embedded persistence for Prepline.
//!
//! Backed by [redb](https://docs.rs/redb). The router keeps its live state
//! in memory; this crate persists what must survive a restart: the hourly
//! traffic history that feeds the heatmap, and the append-only decision log.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Keys are
//! `{function_id}:{ordinal:020}`, which keeps each function's records
//! contiguous and insertion-ordered so bounded-window reads are range scans.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod directory;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use directory::{FunctionDirectory, StaticDirectory};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
