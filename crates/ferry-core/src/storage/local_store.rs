//! SQLite-backed local store
//!
//! Every read and write in the host application goes through this store
//! first. It holds the entity tables, the mutation queue and the pull
//! cursors, and publishes a [`StoreChange`] after each committed mutation.
//!
//! ## Tables
//!
//! - one table per [`Table`] (records, JSON domain fields)
//! - `sync_queue` - locally originated intents
//! - `sync_meta` - per-table pull cursors
//!
//! Each public call runs in its own transaction: a write either fully
//! commits or returns an error.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use crate::config::Config;
use crate::models::{
    QueueAction, QueueItem, QueueStatus, Record, SyncCursor, Table, BEGINNING_OF_TIME,
    SERVER_DEVICE_ID,
};
use crate::sync::ConflictPolicy;

/// Capacity of the change feed before slow subscribers start lagging
const CHANGE_FEED_CAPACITY: usize = 256;

const RECORD_COLUMNS: &str = "id, data, updated_at, _synced, _device_id, _deleted";

const QUEUE_COLUMNS: &str = "id, table_name, record_id, action, payload, device_id, created_at, \
                             status, attempts, last_error, last_attempt_at";

/// What a change touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Rows of an entity table
    Table(Table),
    /// The mutation queue
    Queue,
}

/// Notification published after a committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub topic: Topic,
    /// Affected record IDs (empty for queue changes)
    pub ids: Vec<String>,
}

/// Row selection for [`LocalStore::query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter<'a> {
    /// Every live row
    All,
    /// Rows whose natural key equals the value
    NaturalKey(&'a str),
    /// Rows whose parent id equals the value
    Parent(&'a str),
    /// Rows with local edits not yet acknowledged
    Unsynced,
}

/// Outcome of merging a pulled page
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records written
    pub applied: usize,
    /// Records left alone (tombstoned or protected local edit)
    pub skipped: usize,
}

/// Row and queue counts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Live rows per table
    pub rows: Vec<(Table, i64)>,
    pub pending: i64,
    pub failed: i64,
    /// Size of the database file in bytes (0 when in memory)
    pub database_size: u64,
}

impl StorageStats {
    /// Total live rows across all tables
    pub fn total_rows(&self) -> i64 {
        self.rows.iter().map(|(_, count)| count).sum()
    }
}

/// The local store
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    /// Open or create the store described by the configuration
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_path(&config.sqlite_path())
    }

    /// Open or create the store at a specific path
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_create_dir(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StorageError::from_sqlite(e, path.to_path_buf()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self::from_connection(conn, Some(path.to_path_buf())))
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            path,
            changes,
        }
    }

    /// Subscribe to committed mutations
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind, so the connection is still usable.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn map_write_error(&self, error: rusqlite::Error) -> StorageError {
        match &self.path {
            Some(path) => StorageError::from_sqlite(error, path.clone()),
            None => StorageError::Database(error),
        }
    }

    fn publish(&self, topic: Topic, ids: Vec<String>) {
        // No receivers is fine
        let _ = self.changes.send(StoreChange { topic, ids });
    }

    // ==================== Record Operations ====================

    /// Upsert a record by primary key
    ///
    /// Last call wins; `updated_at` is not compared.
    pub fn put(&self, table: Table, record: &Record) -> StorageResult<()> {
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            upsert_record(&tx, table, record)?;
            tx.commit().map_err(|e| self.map_write_error(e))?;
        }
        self.publish(Topic::Table(table), vec![record.id.clone()]);
        Ok(())
    }

    /// Upsert many records in one transaction
    pub fn bulk_put(&self, table: Table, records: &[Record]) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for record in records {
                upsert_record(&tx, table, record)?;
            }
            tx.commit().map_err(|e| self.map_write_error(e))?;
        }
        self.publish(
            Topic::Table(table),
            records.iter().map(|r| r.id.clone()).collect(),
        );
        Ok(records.len())
    }

    /// Hard delete a row, returning whether it existed
    pub fn delete(&self, table: Table, id: &str) -> StorageResult<bool> {
        let removed = {
            let conn = self.conn();
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?", table.as_str()),
                params![id],
            )
            .map_err(|e| self.map_write_error(e))?
        };
        if removed > 0 {
            self.publish(Topic::Table(table), vec![id.to_string()]);
        }
        Ok(removed > 0)
    }

    /// Get a live record by ID (tombstones are hidden)
    pub fn get(&self, table: Table, id: &str) -> StorageResult<Option<Record>> {
        Ok(self.get_any(table, id)?.filter(|record| !record.deleted))
    }

    /// Get a record by ID, including tombstones
    pub fn get_any(&self, table: Table, id: &str) -> StorageResult<Option<Record>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?",
                    table.as_str()
                ),
                params![id],
                RecordRow::read,
            )
            .optional()?;
        row.map(|row| row.into_record(table)).transpose()
    }

    /// Query live records, newest first
    pub fn query(&self, table: Table, filter: Filter<'_>) -> StorageResult<Vec<Record>> {
        let (clause, arg) = match filter {
            Filter::All => ("", None),
            Filter::NaturalKey(key) => (" AND natural_key = ?1", Some(key)),
            Filter::Parent(parent) => (" AND parent_id = ?1", Some(parent)),
            Filter::Unsynced => (" AND _synced = 0", None),
        };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE _deleted = 0{clause} ORDER BY updated_at DESC, id",
            table.as_str()
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = match arg {
            Some(arg) => stmt
                .query_map(params![arg], RecordRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], RecordRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        rows.into_iter().map(|row| row.into_record(table)).collect()
    }

    /// Count live records in a table
    pub fn count(&self, table: Table) -> StorageResult<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE _deleted = 0", table.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Merge a pulled page, marking written rows as server copies
    ///
    /// Tombstoned rows are never overwritten. Under
    /// [`ConflictPolicy::PreferNewerPending`] an unsynced local row newer
    /// than the incoming copy is kept.
    pub fn merge_pulled(
        &self,
        table: Table,
        records: &[Record],
        policy: ConflictPolicy,
    ) -> StorageResult<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let mut touched = Vec::new();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for incoming in records {
                let local = local_sync_state(&tx, table, &incoming.id)?;
                if let Some(local) = local {
                    if local.deleted {
                        outcome.skipped += 1;
                        continue;
                    }
                    if policy == ConflictPolicy::PreferNewerPending
                        && !local.synced
                        && local.updated_at > incoming.updated_at.timestamp_millis()
                    {
                        outcome.skipped += 1;
                        continue;
                    }
                }

                let mut record = incoming.clone();
                record.synced = true;
                record.device_id = SERVER_DEVICE_ID.to_string();
                upsert_record(&tx, table, &record)?;
                touched.push(record.id);
                outcome.applied += 1;
            }
            tx.commit().map_err(|e| self.map_write_error(e))?;
        }
        if !touched.is_empty() {
            self.publish(Topic::Table(table), touched);
        }
        Ok(outcome)
    }

    /// Insert records not yet present locally; existing rows are untouched
    pub fn insert_missing(&self, table: Table, records: &[Record]) -> StorageResult<usize> {
        let mut inserted = Vec::new();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for record in records {
                if local_sync_state(&tx, table, &record.id)?.is_some() {
                    continue;
                }
                let mut record = record.clone();
                record.synced = true;
                record.device_id = SERVER_DEVICE_ID.to_string();
                upsert_record(&tx, table, &record)?;
                inserted.push(record.id);
            }
            tx.commit().map_err(|e| self.map_write_error(e))?;
        }
        let count = inserted.len();
        if count > 0 {
            self.publish(Topic::Table(table), inserted);
        }
        Ok(count)
    }

    /// Mark a row acknowledged
    ///
    /// Left unsynced when the row changed after the snapshot was taken or
    /// when another queue item for it is still pending or failed.
    pub fn mark_record_synced(
        &self,
        table: Table,
        id: &str,
        snapshot_updated_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let updated = {
            let conn = self.conn();
            conn.execute(
                &format!(
                    "UPDATE {} SET _synced = 1
                     WHERE id = ?1 AND updated_at = ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM sync_queue
                           WHERE table_name = ?3 AND record_id = ?1
                             AND status IN ('pending', 'failed')
                       )",
                    table.as_str()
                ),
                params![id, snapshot_updated_at.timestamp_millis(), table.as_str()],
            )
            .map_err(|e| self.map_write_error(e))?
        };
        if updated > 0 {
            self.publish(Topic::Table(table), vec![id.to_string()]);
        }
        Ok(updated > 0)
    }

    // ==================== Queue Operations ====================

    /// Write a record and append its queue item atomically
    pub fn write_and_enqueue(
        &self,
        table: Table,
        record: &Record,
        action: QueueAction,
        device_id: &str,
    ) -> StorageResult<QueueItem> {
        let created_at = Utc::now();
        let payload = serde_json::to_string(record)?;
        let id = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            upsert_record(&tx, table, record)?;
            tx.execute(
                "INSERT INTO sync_queue (table_name, record_id, action, payload, device_id, created_at, status, attempts)
                 VALUES (?, ?, ?, ?, ?, ?, 'pending', 0)",
                params![
                    table.as_str(),
                    record.id,
                    action.as_str(),
                    payload,
                    device_id,
                    created_at.timestamp_millis(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(|e| self.map_write_error(e))?;
            id
        };

        debug!("Queued {} {} {} as #{}", action.as_str(), table, record.id, id);
        self.publish(Topic::Table(table), vec![record.id.clone()]);
        self.publish(Topic::Queue, Vec::new());

        Ok(QueueItem {
            id,
            table,
            record_id: record.id.clone(),
            action,
            payload: record.clone(),
            device_id: device_id.to_string(),
            created_at,
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        })
    }

    /// Pending queue items in creation order
    pub fn pending_items(&self) -> StorageResult<Vec<QueueItem>> {
        self.queue_items(Some(QueueStatus::Pending))
    }

    /// Queue items, optionally filtered by status, in creation order
    pub fn queue_items(&self, status: Option<QueueStatus>) -> StorageResult<Vec<QueueItem>> {
        let conn = self.conn();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE status = ? ORDER BY created_at, id"
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str()], QueueRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY created_at, id"
                ))?;
                let rows = stmt
                    .query_map([], QueueRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        rows.into_iter().map(QueueRow::into_item).collect()
    }

    /// Items that exhausted their attempts and wait for an operator retry
    pub fn failed_items(&self) -> StorageResult<Vec<QueueItem>> {
        self.queue_items(Some(QueueStatus::Failed))
    }

    /// Number of items waiting to be pushed
    pub fn pending_count(&self) -> StorageResult<i64> {
        self.count_with_status(QueueStatus::Pending)
    }

    /// Number of items that exhausted their attempts
    pub fn failed_count(&self) -> StorageResult<i64> {
        self.count_with_status(QueueStatus::Failed)
    }

    fn count_with_status(&self, status: QueueStatus) -> StorageResult<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = ?",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Mark queue items acknowledged
    pub fn mark_items_synced(&self, ids: &[i64]) -> StorageResult<()> {
        let now = Utc::now().timestamp_millis();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for id in ids {
                tx.execute(
                    "UPDATE sync_queue SET status = 'synced', last_error = NULL, last_attempt_at = ? WHERE id = ?",
                    params![now, id],
                )?;
            }
            tx.commit().map_err(|e| self.map_write_error(e))?;
        }
        self.publish(Topic::Queue, Vec::new());
        Ok(())
    }

    /// Record a rejected attempt for each item
    ///
    /// Items reaching `max_attempts` become failed. Returns the IDs that
    /// failed on this call.
    pub fn record_attempt_failure(
        &self,
        ids: &[i64],
        error: &str,
        max_attempts: u32,
    ) -> StorageResult<Vec<i64>> {
        let now = Utc::now().timestamp_millis();
        let mut newly_failed = Vec::new();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for id in ids {
                tx.execute(
                    "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?, last_attempt_at = ? WHERE id = ?",
                    params![error, now, id],
                )?;
                let changed = tx.execute(
                    "UPDATE sync_queue SET status = 'failed' WHERE id = ? AND status = 'pending' AND attempts >= ?",
                    params![id, max_attempts],
                )?;
                if changed > 0 {
                    newly_failed.push(*id);
                }
            }
            tx.commit().map_err(|e| self.map_write_error(e))?;
        }
        self.publish(Topic::Queue, Vec::new());
        Ok(newly_failed)
    }

    /// Return failed items to the pending set with a fresh attempt count
    ///
    /// With `Some(id)` only that item is retried.
    pub fn retry_failed(&self, id: Option<i64>) -> StorageResult<usize> {
        let reset = {
            let conn = self.conn();
            match id {
                Some(id) => conn.execute(
                    "UPDATE sync_queue SET status = 'pending', attempts = 0 WHERE status = 'failed' AND id = ?",
                    params![id],
                ),
                None => conn.execute(
                    "UPDATE sync_queue SET status = 'pending', attempts = 0 WHERE status = 'failed'",
                    [],
                ),
            }
            .map_err(|e| self.map_write_error(e))?
        };
        if reset > 0 {
            self.publish(Topic::Queue, Vec::new());
        }
        Ok(reset)
    }

    /// Delete acknowledged queue items
    pub fn purge_synced(&self) -> StorageResult<usize> {
        let conn = self.conn();
        let purged = conn
            .execute("DELETE FROM sync_queue WHERE status = 'synced'", [])
            .map_err(|e| self.map_write_error(e))?;
        Ok(purged)
    }

    // ==================== Cursor Operations ====================

    /// Last pull timestamp for a table
    pub fn cursor(&self, table: Table) -> StorageResult<i64> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT last_pull_timestamp FROM sync_meta WHERE table_name = ?",
                params![table.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(BEGINNING_OF_TIME))
    }

    /// All stored cursors
    pub fn cursors(&self) -> StorageResult<Vec<SyncCursor>> {
        Table::ALL
            .into_iter()
            .map(|table| {
                Ok(SyncCursor {
                    table,
                    last_pull_timestamp: self.cursor(table)?,
                })
            })
            .collect()
    }

    /// Advance a table's cursor; a lower value never replaces a higher one
    pub fn advance_cursor(&self, table: Table, timestamp: i64) -> StorageResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_meta (table_name, last_pull_timestamp) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE
             SET last_pull_timestamp = MAX(last_pull_timestamp, excluded.last_pull_timestamp)",
            params![table.as_str(), timestamp],
        )
        .map_err(|e| self.map_write_error(e))?;
        let value = conn.query_row(
            "SELECT last_pull_timestamp FROM sync_meta WHERE table_name = ?",
            params![table.as_str()],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Reset every cursor to the beginning of time
    pub fn reset_cursors(&self) -> StorageResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for table in Table::ALL {
            tx.execute(
                "INSERT OR REPLACE INTO sync_meta (table_name, last_pull_timestamp) VALUES (?, ?)",
                params![table.as_str(), BEGINNING_OF_TIME],
            )?;
        }
        tx.commit().map_err(|e| self.map_write_error(e))?;
        Ok(())
    }

    // ==================== Stats ====================

    /// Row and queue counts
    pub fn stats(&self) -> StorageResult<StorageStats> {
        let rows = Table::ALL
            .into_iter()
            .map(|table| Ok((table, self.count(table)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        let database_size = match &self.path {
            Some(path) => std::fs::metadata(path)
                .map_err(|e| StorageError::from_io(e, path.clone()))?
                .len(),
            None => 0,
        };

        Ok(StorageStats {
            rows,
            pending: self.pending_count()?,
            failed: self.failed_count()?,
            database_size,
        })
    }
}

/// Upsert one record inside an open transaction
fn upsert_record(tx: &Transaction<'_>, table: Table, record: &Record) -> StorageResult<()> {
    let data = serde_json::to_string(&record.fields)?;
    let natural_key = table
        .natural_key_field()
        .and_then(|field| record.get_str(field));
    let parent_id = table.parent_field().and_then(|field| record.get_str(field));

    tx.execute(
        &format!(
            "INSERT INTO {} (id, data, natural_key, parent_id, updated_at, _synced, _device_id, _deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                natural_key = excluded.natural_key,
                parent_id = excluded.parent_id,
                updated_at = excluded.updated_at,
                _synced = excluded._synced,
                _device_id = excluded._device_id,
                _deleted = excluded._deleted",
            table.as_str()
        ),
        params![
            record.id,
            data,
            natural_key,
            parent_id,
            record.updated_at.timestamp_millis(),
            record.synced,
            record.device_id,
            record.deleted,
        ],
    )?;
    Ok(())
}

/// Sync columns of an existing row
struct LocalSyncState {
    updated_at: i64,
    synced: bool,
    deleted: bool,
}

fn local_sync_state(
    tx: &Transaction<'_>,
    table: Table,
    id: &str,
) -> StorageResult<Option<LocalSyncState>> {
    let state = tx
        .query_row(
            &format!(
                "SELECT updated_at, _synced, _deleted FROM {} WHERE id = ?",
                table.as_str()
            ),
            params![id],
            |row| {
                Ok(LocalSyncState {
                    updated_at: row.get(0)?,
                    synced: row.get(1)?,
                    deleted: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Raw record row before JSON decoding
struct RecordRow {
    id: String,
    data: String,
    updated_at: i64,
    synced: bool,
    device_id: String,
    deleted: bool,
}

impl RecordRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            data: row.get(1)?,
            updated_at: row.get(2)?,
            synced: row.get(3)?,
            device_id: row.get(4)?,
            deleted: row.get(5)?,
        })
    }

    fn into_record(self, table: Table) -> StorageResult<Record> {
        let fields: Map<String, Value> =
            serde_json::from_str(&self.data).map_err(|e| StorageError::CorruptRow {
                table: table.to_string(),
                id: self.id.clone(),
                details: e.to_string(),
            })?;

        Ok(Record {
            id: self.id,
            updated_at: millis_to_datetime(self.updated_at),
            synced: self.synced,
            device_id: self.device_id,
            deleted: self.deleted,
            fields,
        })
    }
}

/// Raw queue row before decoding
struct QueueRow {
    id: i64,
    table: String,
    record_id: String,
    action: String,
    payload: String,
    device_id: String,
    created_at: i64,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    last_attempt_at: Option<i64>,
}

impl QueueRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table: row.get(1)?,
            record_id: row.get(2)?,
            action: row.get(3)?,
            payload: row.get(4)?,
            device_id: row.get(5)?,
            created_at: row.get(6)?,
            status: row.get(7)?,
            attempts: row.get(8)?,
            last_error: row.get(9)?,
            last_attempt_at: row.get(10)?,
        })
    }

    fn into_item(self) -> StorageResult<QueueItem> {
        let corrupt = |details: String| StorageError::CorruptRow {
            table: "sync_queue".to_string(),
            id: self.id.to_string(),
            details,
        };

        let table: Table = self.table.parse().map_err(|e| corrupt(format!("{e}")))?;
        let action = QueueAction::parse(&self.action)
            .ok_or_else(|| corrupt(format!("unknown action '{}'", self.action)))?;
        let status = QueueStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let payload: Record =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;

        Ok(QueueItem {
            id: self.id,
            table,
            record_id: self.record_id,
            action,
            payload,
            device_id: self.device_id,
            created_at: millis_to_datetime(self.created_at),
            status,
            attempts: self.attempts,
            last_error: self.last_error,
            last_attempt_at: self.last_attempt_at.map(millis_to_datetime),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn patient(id: &str, email: &str) -> Record {
        Record::from_json(json!({"id": id, "name": "Ada", "email": email})).unwrap()
    }

    fn allergy(id: &str, patient_id: &str) -> Record {
        Record::from_json(json!({"id": id, "patient_id": patient_id, "substance": "latex"}))
            .unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let store = LocalStore::open_in_memory().unwrap();
        let record = patient("p-1", "ada@example.com");

        store.put(Table::Patients, &record).unwrap();

        let loaded = store.get(Table::Patients, "p-1").unwrap().unwrap();
        assert_eq!(loaded.get_str("email"), Some("ada@example.com"));
        assert_eq!(
            loaded.updated_at.timestamp_millis(),
            record.updated_at.timestamp_millis()
        );
        assert!(store.get(Table::Patients, "missing").unwrap().is_none());
    }

    #[test]
    fn test_put_is_last_call_wins() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut newer = patient("p-1", "new@example.com");
        let mut older = patient("p-1", "old@example.com");
        newer.updated_at = Utc::now();
        older.updated_at = newer.updated_at - Duration::hours(1);

        store.put(Table::Patients, &newer).unwrap();
        store.put(Table::Patients, &older).unwrap();
        store.put(Table::Patients, &older).unwrap();

        let loaded = store.get(Table::Patients, "p-1").unwrap().unwrap();
        assert_eq!(loaded.get_str("email"), Some("old@example.com"));
        assert_eq!(store.count(Table::Patients).unwrap(), 1);
    }

    #[test]
    fn test_query_by_index() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .bulk_put(
                Table::Allergies,
                &[allergy("a-1", "p-1"), allergy("a-2", "p-1"), allergy("a-3", "p-2")],
            )
            .unwrap();
        store
            .put(Table::Patients, &patient("p-1", "ada@example.com"))
            .unwrap();

        let children = store.query(Table::Allergies, Filter::Parent("p-1")).unwrap();
        assert_eq!(children.len(), 2);

        let by_key = store
            .query(Table::Patients, Filter::NaturalKey("ada@example.com"))
            .unwrap();
        assert_eq!(by_key.len(), 1);
        assert_eq!(store.query(Table::Allergies, Filter::All).unwrap().len(), 3);
        assert_eq!(store.query(Table::Allergies, Filter::Unsynced).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_is_hard() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .put(Table::Patients, &patient("p-1", "ada@example.com"))
            .unwrap();

        assert!(store.delete(Table::Patients, "p-1").unwrap());
        assert!(store.get_any(Table::Patients, "p-1").unwrap().is_none());
        assert!(!store.delete(Table::Patients, "p-1").unwrap());
    }

    #[test]
    fn test_tombstones_are_hidden_from_reads() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut record = patient("p-1", "ada@example.com");
        record.deleted = true;
        store.put(Table::Patients, &record).unwrap();

        assert!(store.get(Table::Patients, "p-1").unwrap().is_none());
        assert!(store.get_any(Table::Patients, "p-1").unwrap().unwrap().deleted);
        assert_eq!(store.count(Table::Patients).unwrap(), 0);
        assert!(store.query(Table::Patients, Filter::All).unwrap().is_empty());
    }

    #[test]
    fn test_merge_pulled_is_idempotent() {
        let store = LocalStore::open_in_memory().unwrap();
        let page = vec![patient("p-1", "a@example.com"), patient("p-2", "b@example.com")];

        store
            .merge_pulled(Table::Patients, &page, ConflictPolicy::ArrivalOrder)
            .unwrap();
        let first = store.query(Table::Patients, Filter::All).unwrap();
        store
            .merge_pulled(Table::Patients, &page, ConflictPolicy::ArrivalOrder)
            .unwrap();
        let second = store.query(Table::Patients, Filter::All).unwrap();

        assert_eq!(first, second);
        assert!(second.iter().all(|r| r.synced && r.is_from_server()));
    }

    #[test]
    fn test_merge_pulled_skips_tombstones() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut tombstone = patient("p-1", "a@example.com");
        tombstone.deleted = true;
        store.put(Table::Patients, &tombstone).unwrap();

        let outcome = store
            .merge_pulled(
                Table::Patients,
                &[patient("p-1", "a@example.com")],
                ConflictPolicy::ArrivalOrder,
            )
            .unwrap();

        assert_eq!(outcome, MergeOutcome { applied: 0, skipped: 1 });
        assert!(store.get(Table::Patients, "p-1").unwrap().is_none());
    }

    #[test]
    fn test_merge_pulled_conflict_policies() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut local = patient("p-1", "local@example.com");
        local.updated_at = Utc::now();
        store.put(Table::Patients, &local).unwrap();

        let mut remote = patient("p-1", "remote@example.com");
        remote.updated_at = local.updated_at - Duration::minutes(5);

        let kept = store
            .merge_pulled(
                Table::Patients,
                &[remote.clone()],
                ConflictPolicy::PreferNewerPending,
            )
            .unwrap();
        assert_eq!(kept.skipped, 1);
        let loaded = store.get(Table::Patients, "p-1").unwrap().unwrap();
        assert_eq!(loaded.get_str("email"), Some("local@example.com"));

        store
            .merge_pulled(Table::Patients, &[remote], ConflictPolicy::ArrivalOrder)
            .unwrap();
        let loaded = store.get(Table::Patients, "p-1").unwrap().unwrap();
        assert_eq!(loaded.get_str("email"), Some("remote@example.com"));
        assert!(loaded.synced);
    }

    #[test]
    fn test_insert_missing_leaves_existing_rows() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut local = allergy("a-1", "p-1");
        local.set("substance", "penicillin");
        store.put(Table::Allergies, &local).unwrap();

        let inserted = store
            .insert_missing(Table::Allergies, &[allergy("a-1", "p-1"), allergy("a-2", "p-1")])
            .unwrap();

        assert_eq!(inserted, 1);
        let kept = store.get(Table::Allergies, "a-1").unwrap().unwrap();
        assert_eq!(kept.get_str("substance"), Some("penicillin"));
        assert!(store.get(Table::Allergies, "a-2").unwrap().unwrap().synced);
    }

    #[test]
    fn test_write_and_enqueue() {
        let store = LocalStore::open_in_memory().unwrap();
        let record = patient("p-1", "ada@example.com");

        let item = store
            .write_and_enqueue(Table::Patients, &record, QueueAction::Create, "dev-1")
            .unwrap();

        assert!(store.get(Table::Patients, "p-1").unwrap().is_some());
        let pending = store.pending_items().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, item.id);
        assert_eq!(pending[0].payload.id, "p-1");
        assert_eq!(pending[0].device_id, "dev-1");
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_attempt_failures_reach_ceiling() {
        let store = LocalStore::open_in_memory().unwrap();
        let item = store
            .write_and_enqueue(
                Table::Patients,
                &patient("p-1", "a@example.com"),
                QueueAction::Create,
                "dev-1",
            )
            .unwrap();

        for _ in 0..2 {
            let failed = store.record_attempt_failure(&[item.id], "HTTP 500", 3).unwrap();
            assert!(failed.is_empty());
        }
        let failed = store.record_attempt_failure(&[item.id], "HTTP 500", 3).unwrap();
        assert_eq!(failed, vec![item.id]);

        let items = store.queue_items(Some(QueueStatus::Failed)).unwrap();
        assert_eq!(items[0].attempts, 3);
        assert_eq!(items[0].last_error.as_deref(), Some("HTTP 500"));
        assert!(items[0].last_attempt_at.is_some());
        assert_eq!(store.pending_count().unwrap(), 0);

        assert_eq!(store.retry_failed(None).unwrap(), 1);
        let pending = store.pending_items().unwrap();
        assert_eq!(pending[0].attempts, 0);
    }

    #[test]
    fn test_mark_synced_and_purge() {
        let store = LocalStore::open_in_memory().unwrap();
        let record = patient("p-1", "a@example.com");
        let item = store
            .write_and_enqueue(Table::Patients, &record, QueueAction::Create, "dev-1")
            .unwrap();

        store.mark_items_synced(&[item.id]).unwrap();
        assert!(store
            .mark_record_synced(Table::Patients, "p-1", record.updated_at)
            .unwrap());

        assert!(store.get(Table::Patients, "p-1").unwrap().unwrap().synced);
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(store.purge_synced().unwrap(), 1);
        assert!(store.queue_items(None).unwrap().is_empty());
    }

    #[test]
    fn test_mark_record_synced_ignores_newer_edits() {
        let store = LocalStore::open_in_memory().unwrap();
        let snapshot = patient("p-1", "a@example.com");
        store.put(Table::Patients, &snapshot).unwrap();

        let mut edited = snapshot.clone();
        edited.updated_at = snapshot.updated_at + Duration::seconds(1);
        store.put(Table::Patients, &edited).unwrap();

        assert!(!store
            .mark_record_synced(Table::Patients, "p-1", snapshot.updated_at)
            .unwrap());
        assert!(!store.get(Table::Patients, "p-1").unwrap().unwrap().synced);
    }

    #[test]
    fn test_mark_record_synced_waits_for_later_queue_items() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = patient("p-1", "a@example.com");
        let first_item = store
            .write_and_enqueue(Table::Patients, &first, QueueAction::Create, "dev-1")
            .unwrap();

        // Same millisecond, different content
        let mut second = first.clone();
        second
            .fields
            .insert("name".to_string(), json!("Ada Lovelace"));
        store
            .write_and_enqueue(Table::Patients, &second, QueueAction::Update, "dev-1")
            .unwrap();

        store.mark_items_synced(&[first_item.id]).unwrap();
        assert!(!store
            .mark_record_synced(Table::Patients, "p-1", first.updated_at)
            .unwrap());

        let row = store.get(Table::Patients, "p-1").unwrap().unwrap();
        assert!(!row.synced);
        assert_eq!(row.get_str("name"), Some("Ada Lovelace"));
        assert_eq!(
            store
                .query(Table::Patients, Filter::Unsynced)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_cursor_never_regresses() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.cursor(Table::Patients).unwrap(), BEGINNING_OF_TIME);

        assert_eq!(store.advance_cursor(Table::Patients, 200).unwrap(), 200);
        assert_eq!(store.advance_cursor(Table::Patients, 100).unwrap(), 200);
        assert_eq!(store.cursor(Table::Patients).unwrap(), 200);

        store.reset_cursors().unwrap();
        assert!(store
            .cursors()
            .unwrap()
            .iter()
            .all(|c| c.last_pull_timestamp == BEGINNING_OF_TIME));
    }

    #[test]
    fn test_change_feed() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();

        store
            .put(Table::Patients, &patient("p-1", "a@example.com"))
            .unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.topic, Topic::Table(Table::Patients));
        assert_eq!(change.ids, vec!["p-1".to_string()]);
    }

    #[test]
    fn test_data_persists_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("ferry.db");

        {
            let store = LocalStore::open_path(&path).unwrap();
            store
                .write_and_enqueue(
                    Table::Patients,
                    &patient("p-1", "a@example.com"),
                    QueueAction::Create,
                    "dev-1",
                )
                .unwrap();
            store.advance_cursor(Table::Messages, 42).unwrap();
        }

        let store = LocalStore::open_path(&path).unwrap();
        assert!(store.get(Table::Patients, "p-1").unwrap().is_some());
        assert_eq!(store.pending_count().unwrap(), 1);
        assert_eq!(store.cursor(Table::Messages).unwrap(), 42);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_rows(), 1);
        assert_eq!(stats.pending, 1);
        assert!(stats.database_size > 0);
    }

    #[test]
    fn test_open_reports_blocked_data_directory() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("data");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = match LocalStore::open_path(&blocker.join("ferry.db")) {
            Err(e) => e,
            Ok(_) => panic!("expected open to fail"),
        };

        assert!(matches!(err, StorageError::CreateDirectory { .. }));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_stats_reports_missing_database_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ferry.db");
        let store = LocalStore::open_path(&path).unwrap();

        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            store.stats(),
            Err(StorageError::NotFound { .. })
        ));
    }
}
