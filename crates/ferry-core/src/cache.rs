//! Read-through cache
//!
//! Lookups that never give a negative answer just because the local store
//! hasn't seen a record yet. While online the remote is asked and its
//! answer is written to the store before being returned; while offline (or
//! when the remote can't be reached) the best local match is used.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{Record, Table};
use crate::storage::{Filter, StorageError};
use crate::sync::{RemoteError, SyncEngine};

/// Errors from cache lookups
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Table '{0}' has no natural key")]
    NoNaturalKey(Table),

    #[error("Table '{0}' has no parent field")]
    NoParent(Table),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Local children plus the background refresh, if one was started
#[derive(Debug)]
pub struct Related {
    /// Children known locally when the call was made
    pub records: Vec<Record>,
    /// Resolves to the number of newly seen children written locally
    pub refresh: Option<JoinHandle<Result<usize, CacheError>>>,
}

/// Read-through lookups over the local store and the remote API
#[derive(Clone)]
pub struct ReadThroughCache {
    engine: Arc<SyncEngine>,
}

impl ReadThroughCache {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Find a record by its table's natural key
    ///
    /// Online, the remote answer is authoritative: its first match is
    /// stored and returned, and "not found" is only overridden by a local
    /// record that hasn't been pushed yet.
    pub async fn lookup_by_natural_key(
        &self,
        table: Table,
        key: &str,
    ) -> Result<Option<Record>, CacheError> {
        let field = table
            .natural_key_field()
            .ok_or(CacheError::NoNaturalKey(table))?;
        let store = self.engine.store();

        if self.engine.is_online() {
            match self.engine.remote().find(table, field, key).await {
                Ok(records) => {
                    let Some(authoritative) = records.into_iter().next() else {
                        debug!("{} '{}' not found remotely", table, key);
                        return Ok(self.unpushed_local_match(table, key)?);
                    };
                    store.merge_pulled(
                        table,
                        std::slice::from_ref(&authoritative),
                        self.engine.config().conflict_policy,
                    )?;
                    return Ok(store.get(table, &authoritative.id)?);
                }
                Err(e) if e.is_network() => {
                    debug!("Lookup of {} fell back to local store: {}", table, e);
                }
                Err(e) => {
                    warn!("Lookup of {} failed remotely, using local store: {}", table, e);
                }
            }
        }

        Ok(self.best_local_match(table, key)?)
    }

    /// Children of `parent_id`, local first
    ///
    /// Returns immediately with the local rows. While online a background
    /// task fetches the remote children and writes any not yet present.
    pub fn list_related(&self, table: Table, parent_id: &str) -> Result<Related, CacheError> {
        let field = table.parent_field().ok_or(CacheError::NoParent(table))?;
        let records = self
            .engine
            .store()
            .query(table, Filter::Parent(parent_id))?;

        let refresh = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if self.engine.is_online() => {
                let engine = Arc::clone(&self.engine);
                let parent_id = parent_id.to_string();
                Some(runtime.spawn(async move {
                    let remote = engine.remote().find(table, field, &parent_id).await?;
                    let inserted = engine.store().insert_missing(table, &remote)?;
                    debug!(
                        "Merged {} new {} record(s) for parent {}",
                        inserted, table, parent_id
                    );
                    Ok(inserted)
                }))
            }
            _ => None,
        };

        Ok(Related { records, refresh })
    }

    /// Best local candidate: server copy, then acknowledged, then newest
    fn best_local_match(&self, table: Table, key: &str) -> Result<Option<Record>, StorageError> {
        let candidates = self
            .engine
            .store()
            .query(table, Filter::NaturalKey(key))?;
        // Candidates arrive newest first; min_by_key keeps the first of equals
        Ok(candidates
            .into_iter()
            .min_by_key(|record| (!record.is_from_server(), !record.synced)))
    }

    fn unpushed_local_match(
        &self,
        table: Table,
        key: &str,
    ) -> Result<Option<Record>, StorageError> {
        let candidates = self
            .engine
            .store()
            .query(table, Filter::NaturalKey(key))?;
        Ok(candidates.into_iter().find(|record| !record.synced))
    }
}
