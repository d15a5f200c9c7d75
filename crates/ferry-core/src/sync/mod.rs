//! Push/pull synchronization with the remote API
//!
//! ## Protocol
//!
//! 1. Local writes go to the store and append a queue item
//! 2. Pending items are pushed in creation order, in fixed-size batches
//! 3. Each table is pulled page by page since its cursor
//! 4. Pulled records are merged into the store and the cursor advances
//!
//! ## Usage
//!
//! ```ignore
//! let engine = Arc::new(SyncEngine::new(store, remote, device_id, EngineConfig::default(), true));
//! let handle = spawn_sync_task(engine.clone(), RunnerConfig::default());
//! engine.save(Table::Patients, record)?;
//! ```

mod engine;
mod http;
mod policy;
mod remote;
mod runner;
mod status;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::{
    EngineConfig, FlushReport, PullReport, SyncEngine, SyncError, SyncReport, SyncResult,
};
pub use http::HttpRemote;
pub use policy::{ConflictPolicy, RetryPolicy};
pub use remote::{PullPage, PushBatch, RemoteApi, RemoteError, RemoteResult, Unconfigured};
pub use runner::{spawn_sync_task, RunnerConfig, SyncCommand, SyncHandle};
pub use status::{StatusBus, StatusUpdate, SubscriptionId, SyncState};
