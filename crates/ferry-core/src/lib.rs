//! Ferry Core Library
//!
//! This crate provides the core functionality for Ferry, a local-first
//! data sync engine: every read and write completes against a local SQLite
//! store, and changes are reconciled with a remote API whenever
//! connectivity allows.
//!
//! # Architecture
//!
//! - **Local store**: entity tables, the mutation queue and pull cursors
//! - **Sync engine**: debounced batch push, paged incremental pull, status
//! - **Read-through cache**: lookups that consult the remote while online
//! - **Live queries**: views that recompute when their tables change
//!
//! # Quick Start
//!
//! ```text
//! let ferry = Ferry::open()?;
//! let _sync = ferry.spawn_sync();
//!
//! // Write locally; pushed in the background
//! let record = Record::from_json(json!({"name": "Ada", "email": "ada@example.com"})).unwrap();
//! ferry.engine().save(Table::Patients, record)?;
//!
//! // Live view over the table
//! let patients = ferry.observe([Topic::Table(Table::Patients)], |store| {
//!     store.query(Table::Patients, Filter::All)
//! });
//! ```
//!
//! # Modules
//!
//! - `client`: Application handle (main entry point)
//! - `models`: Tables, records, queue items and cursors
//! - `storage`: SQLite local store
//! - `sync`: Sync engine, remote API and background task
//! - `cache`: Read-through lookups
//! - `live`: Live queries
//! - `identity`: Device identity
//! - `config`: Application configuration

pub mod cache;
pub mod client;
pub mod config;
pub mod identity;
pub mod live;
pub mod models;
pub mod storage;
pub mod sync;

pub use cache::{CacheError, ReadThroughCache, Related};
pub use client::Ferry;
pub use config::Config;
pub use identity::{DeviceIdentity, InitResult};
pub use live::{observe, LiveQuery, LiveValue};
pub use models::{QueueAction, QueueItem, QueueStatus, Record, SyncCursor, Table};
pub use storage::{Filter, LocalStore, StorageError, StorageStats, StoreChange, Topic};
pub use sync::{
    ConflictPolicy, EngineConfig, RemoteApi, RetryPolicy, SyncCommand, SyncEngine, SyncError,
    SyncHandle, SyncState, StatusUpdate,
};
