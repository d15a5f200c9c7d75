//! Storage layer
//!
//! A single SQLite database holds the entity tables, the mutation queue
//! and the pull cursors.
//!
//! ## Architecture
//!
//! - **Entity tables**: the application's working copy, read and written
//!   locally regardless of connectivity
//! - **Queue**: locally originated changes awaiting server acknowledgment
//! - **Cursors**: per-table watermark of the last successful pull
//!
//! Committed mutations are published on a broadcast channel so that live
//! queries can recompute.

pub mod error;
pub mod local_store;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use local_store::{Filter, LocalStore, MergeOutcome, StorageStats, StoreChange, Topic};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
