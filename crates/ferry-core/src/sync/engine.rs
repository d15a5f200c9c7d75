//! Sync engine
//!
//! The only component that talks to the remote API. It turns local
//! intents into push batches and pulled pages into local rows, and
//! publishes its state on a [`StatusBus`].
//!
//! ## States
//!
//! ```text
//!            enqueue / timer            batch ok
//!   idle ───────────────────▶ syncing ───────────▶ idle
//!    ▲                          │  │   no progress
//!    │ connectivity restored    │  └─────────────▶ error
//!    │                          │ network failure
//! offline ◀─────────────────────┘
//! ```
//!
//! Only one flush, pull or bootstrap runs at a time; a second caller gets
//! [`SyncError::Busy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::policy::{ConflictPolicy, RetryPolicy};
use super::remote::{PushBatch, RemoteApi, RemoteError};
use super::status::{StatusBus, StatusUpdate, SubscriptionId, SyncState};
use crate::config::Config;
use crate::models::{QueueAction, QueueItem, QueueStatus, Record, Table};
use crate::storage::{LocalStore, StorageError};

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Sync is offline")]
    Offline,

    #[error("A sync operation is already running")]
    Busy,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue items per push request
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub conflict_policy: ConflictPolicy,
    /// Tables pulled, in order
    pub tables: Vec<Table>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry: RetryPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            tables: Table::ALL.to_vec(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            retry: config.retry_policy(),
            conflict_policy: config.conflict_policy,
            tables: Table::ALL.to_vec(),
        }
    }
}

/// Outcome of a flush
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Items acknowledged by the server
    pub pushed: usize,
    /// Batches acknowledged
    pub batches: usize,
    /// Items that reached the attempt ceiling during this flush
    pub newly_failed: Vec<i64>,
    /// Server rejection that halted the flush
    pub error: Option<String>,
    /// A network failure aborted the flush
    pub went_offline: bool,
}

/// Outcome of a pull or bootstrap
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    pub applied: usize,
    /// Records left alone (tombstoned or protected local edits)
    pub skipped: usize,
    /// Per-table failures; those tables are retried on the next pull
    pub errors: Vec<String>,
    pub went_offline: bool,
}

/// Outcome of a flush followed by a pull
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub flush: FlushReport,
    pub pull: PullReport,
}

/// How an operation ended, for the state machine
enum Settle {
    /// Nothing was attempted
    Untouched,
    Progress(Option<String>),
    Failed(String),
    Offline,
}

/// Clears the syncing flag when dropped
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The sync engine
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    device_id: String,
    config: EngineConfig,
    status: StatusBus,
    online: AtomicBool,
    syncing: AtomicBool,
    flush_requested: Notify,
}

impl SyncEngine {
    /// Create an engine; the initial state is idle when `online`, else offline
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        device_id: impl Into<String>,
        config: EngineConfig,
        online: bool,
    ) -> Self {
        let initial = if online {
            SyncState::Idle
        } else {
            SyncState::Offline
        };
        Self {
            store,
            remote,
            device_id: device_id.into(),
            config,
            status: StatusBus::new(initial),
            online: AtomicBool::new(online),
            syncing: AtomicBool::new(false),
            flush_requested: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== Status ====================

    pub fn state(&self) -> SyncState {
        self.status.state()
    }

    /// Latest state with its detail string
    pub fn status(&self) -> StatusUpdate {
        self.status.latest()
    }

    /// Register a callback for every state transition
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        self.status.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status.unsubscribe(id)
    }

    /// Receiver that always holds the latest status
    pub fn watch_status(&self) -> watch::Receiver<StatusUpdate> {
        self.status.watch()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Apply a host connectivity event, returning whether it changed anything
    ///
    /// Going online moves to idle and requests a flush; the caller (usually
    /// the runner) follows up with a pull.
    pub fn set_online(&self, online: bool) -> bool {
        if self.online.swap(online, Ordering::AcqRel) == online {
            return false;
        }
        if online {
            info!("Connectivity restored");
            self.status
                .publish(SyncState::Idle, Some("Connectivity restored".to_string()));
            self.flush_requested.notify_one();
        } else {
            info!("Connectivity lost");
            self.status
                .publish(SyncState::Offline, Some("Connectivity lost".to_string()));
        }
        true
    }

    fn go_offline(&self, detail: String) {
        warn!("Network failure, going offline: {}", detail);
        self.online.store(false, Ordering::Release);
        self.status.publish(SyncState::Offline, Some(detail));
    }

    /// Check whether the remote answers again while offline
    ///
    /// Issues one pull request for the first table; its page is discarded
    /// and fetched again by the next pull since the cursor is untouched.
    /// Any answer, including a server error, counts as reachable and moves
    /// the engine back online. Returns whether the engine is online.
    pub async fn check_reachable(&self) -> SyncResult<bool> {
        if self.is_online() {
            return Ok(true);
        }
        let Some(&table) = self.config.tables.first() else {
            return Ok(false);
        };
        let since = self.store.cursor(table)?;
        match self.remote.pull(table, since).await {
            Err(e) if e.is_network() => {
                debug!("Remote still unreachable: {}", e);
                Ok(false)
            }
            _ => {
                self.set_online(true);
                Ok(true)
            }
        }
    }

    // ==================== Local writes ====================

    /// Write a record locally and queue it for push
    ///
    /// The write is visible to readers before this returns; no network call
    /// is made. A delete stores a tombstone.
    pub fn enqueue(
        &self,
        table: Table,
        mut record: Record,
        action: QueueAction,
    ) -> SyncResult<QueueItem> {
        record.updated_at = Utc::now();
        record.synced = false;
        record.device_id = self.device_id.clone();
        record.deleted = action == QueueAction::Delete;

        let item = self
            .store
            .write_and_enqueue(table, &record, action, &self.device_id)?;
        self.flush_requested.notify_one();
        Ok(item)
    }

    /// Create or update a record, picking the action from the local copy
    pub fn save(&self, table: Table, record: Record) -> SyncResult<QueueItem> {
        let action = match self.store.get(table, &record.id)? {
            Some(_) => QueueAction::Update,
            None => QueueAction::Create,
        };
        self.enqueue(table, record, action)
    }

    /// Tombstone a record and queue the delete
    ///
    /// Returns `None` when no live record has that ID.
    pub fn delete(&self, table: Table, id: &str) -> SyncResult<Option<QueueItem>> {
        let Some(record) = self.store.get(table, id)? else {
            return Ok(None);
        };
        self.enqueue(table, record, QueueAction::Delete).map(Some)
    }

    // ==================== Queue ====================

    pub fn pending_count(&self) -> SyncResult<i64> {
        Ok(self.store.pending_count()?)
    }

    pub fn failed_items(&self) -> SyncResult<Vec<QueueItem>> {
        Ok(self.store.failed_items()?)
    }

    pub fn queue_items(&self, status: Option<QueueStatus>) -> SyncResult<Vec<QueueItem>> {
        Ok(self.store.queue_items(status)?)
    }

    /// Return failed items (or one item) to the pending set
    pub fn retry_failed(&self, id: Option<i64>) -> SyncResult<usize> {
        let reset = self.store.retry_failed(id)?;
        if reset > 0 {
            info!("Retrying {} failed item(s)", reset);
            self.flush_requested.notify_one();
        }
        Ok(reset)
    }

    /// Signalled whenever a flush is wanted (enqueue, retry, reconnect)
    pub fn flush_signal(&self) -> &Notify {
        &self.flush_requested
    }

    /// How long automatic flushing should wait for the queue head's backoff
    ///
    /// `None` when nothing is pending.
    pub fn next_flush_delay(&self) -> SyncResult<Option<Duration>> {
        let pending = self.store.pending_items()?;
        Ok(pending.first().map(|head| {
            self.config
                .retry
                .remaining_backoff(head.attempts, head.last_attempt_at, Utc::now())
        }))
    }

    // ==================== Network operations ====================

    fn begin(&self) -> SyncResult<SyncGuard<'_>> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::Busy)?;
        Ok(SyncGuard(&self.syncing))
    }

    fn settle(&self, outcome: Settle) {
        match outcome {
            Settle::Untouched | Settle::Offline => {}
            Settle::Progress(detail) => self.status.publish(SyncState::Idle, detail),
            Settle::Failed(detail) => self.status.publish(SyncState::Error, Some(detail)),
        }
    }

    /// Push pending queue items in creation order
    pub async fn flush(&self) -> SyncResult<FlushReport> {
        let _guard = self.begin()?;
        let result = self.push_pending().await;
        self.settle(match &result {
            Ok(report) => flush_settle(report),
            Err(e) => Settle::Failed(e.to_string()),
        });
        result
    }

    /// Pull every table since its cursor
    pub async fn pull(&self) -> SyncResult<PullReport> {
        let _guard = self.begin()?;
        self.status
            .publish(SyncState::Syncing, Some("Pulling changes".to_string()));
        let result = self.pull_tables(&self.config.tables).await;
        self.settle(match &result {
            Ok(report) => pull_settle(report),
            Err(e) => Settle::Failed(e.to_string()),
        });
        result
    }

    /// Pull a single table since its cursor
    pub async fn pull_table(&self, table: Table) -> SyncResult<PullReport> {
        let _guard = self.begin()?;
        self.status
            .publish(SyncState::Syncing, Some(format!("Pulling {}", table)));
        let result = self.pull_tables(&[table]).await;
        self.settle(match &result {
            Ok(report) => pull_settle(report),
            Err(e) => Settle::Failed(e.to_string()),
        });
        result
    }

    /// Flush, then pull
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let _guard = self.begin()?;
        let result = self.flush_then_pull().await;
        self.settle(match &result {
            Ok(report) if report.flush.went_offline || report.pull.went_offline => {
                Settle::Offline
            }
            Ok(report) => match (flush_settle(&report.flush), pull_settle(&report.pull)) {
                (Settle::Failed(detail), Settle::Failed(_))
                | (Settle::Untouched, Settle::Failed(detail)) => Settle::Failed(detail),
                (Settle::Failed(detail), _) | (_, Settle::Failed(detail)) => {
                    Settle::Progress(Some(detail))
                }
                _ => Settle::Progress(None),
            },
            Err(e) => Settle::Failed(e.to_string()),
        });
        result
    }

    /// Reset every cursor and pull all tables from the beginning
    pub async fn bootstrap(&self) -> SyncResult<PullReport> {
        let _guard = self.begin()?;
        info!("Bootstrapping local store");
        self.status
            .publish(SyncState::Syncing, Some("Bootstrapping".to_string()));
        let result = match self.store.reset_cursors() {
            Ok(()) => self.pull_tables(&self.config.tables).await,
            Err(e) => Err(e.into()),
        };
        self.settle(match &result {
            Ok(report) => pull_settle(report),
            Err(e) => Settle::Failed(e.to_string()),
        });
        result
    }

    async fn flush_then_pull(&self) -> SyncResult<SyncReport> {
        let flush = self.push_pending().await?;
        if flush.went_offline {
            return Ok(SyncReport {
                flush,
                pull: PullReport::default(),
            });
        }
        self.status
            .publish(SyncState::Syncing, Some("Pulling changes".to_string()));
        let pull = self.pull_tables(&self.config.tables).await?;
        Ok(SyncReport { flush, pull })
    }

    async fn push_pending(&self) -> SyncResult<FlushReport> {
        let purged = self.store.purge_synced()?;
        if purged > 0 {
            debug!("Purged {} acknowledged queue item(s)", purged);
        }

        let pending = self.store.pending_items()?;
        let mut report = FlushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        self.status.publish(
            SyncState::Syncing,
            Some(format!("Pushing {} change(s)", pending.len())),
        );

        for batch in pending.chunks(self.config.batch_size.max(1)) {
            let ids: Vec<i64> = batch.iter().map(|item| item.id).collect();
            debug!("Pushing batch of {} item(s)", batch.len());

            let request = PushBatch {
                items: batch.to_vec(),
            };
            match self.remote.push(&request).await {
                Ok(()) => {
                    self.store.mark_items_synced(&ids)?;
                    for item in batch {
                        self.store.mark_record_synced(
                            item.table,
                            &item.record_id,
                            item.payload.updated_at,
                        )?;
                    }
                    report.pushed += batch.len();
                    report.batches += 1;
                }
                Err(e) if e.is_network() => {
                    // Unattempted batches stay pending
                    self.go_offline(e.to_string());
                    report.went_offline = true;
                    return Ok(report);
                }
                Err(e) => {
                    warn!("Push batch rejected: {}", e);
                    let failed = self.store.record_attempt_failure(
                        &ids,
                        &e.to_string(),
                        self.config.retry.max_attempts,
                    )?;
                    if !failed.is_empty() {
                        warn!("{} item(s) reached the attempt ceiling", failed.len());
                    }
                    report.newly_failed.extend(failed);
                    report.error = Some(e.to_string());
                    // Later batches may hold newer edits of the same records
                    break;
                }
            }
        }

        info!("Pushed {} item(s) in {} batch(es)", report.pushed, report.batches);
        Ok(report)
    }

    async fn pull_tables(&self, tables: &[Table]) -> SyncResult<PullReport> {
        let mut report = PullReport::default();

        for &table in tables {
            loop {
                let since = self.store.cursor(table)?;
                let page = match self.remote.pull(table, since).await {
                    Ok(page) => page,
                    Err(e) if e.is_network() => {
                        self.go_offline(e.to_string());
                        report.went_offline = true;
                        return Ok(report);
                    }
                    Err(e) => {
                        warn!("Pull of {} failed: {}", table, e);
                        report.errors.push(format!("{}: {}", table, e));
                        break;
                    }
                };

                let merged =
                    self.store
                        .merge_pulled(table, &page.records, self.config.conflict_policy)?;
                let cursor = self.store.advance_cursor(table, page.timestamp)?;
                debug!(
                    "Pulled {} page: {} applied, {} skipped, cursor {}",
                    table, merged.applied, merged.skipped, cursor
                );

                report.pages += 1;
                report.applied += merged.applied;
                report.skipped += merged.skipped;

                if !page.has_more {
                    break;
                }
                // The next request would repeat this one
                if cursor <= since {
                    warn!("Pull of {} reported more pages without progress", table);
                    break;
                }
            }
        }

        Ok(report)
    }
}

fn flush_settle(report: &FlushReport) -> Settle {
    if report.went_offline {
        Settle::Offline
    } else if report.pushed > 0 {
        Settle::Progress(report.error.clone())
    } else if let Some(error) = &report.error {
        Settle::Failed(error.clone())
    } else {
        Settle::Untouched
    }
}

fn pull_settle(report: &PullReport) -> Settle {
    if report.went_offline {
        Settle::Offline
    } else if report.pages == 0 && !report.errors.is_empty() {
        Settle::Failed(report.errors.join("; "))
    } else {
        Settle::Progress(None)
    }
}
