//! Application handle
//!
//! `Ferry` wires the pieces together for a host application:
//! - the device identity
//! - the local store
//! - the sync engine and its remote
//! - the read-through cache
//!
//! Each handle is independent; tests open as many as they need.
//!
//! ## Usage
//!
//! ```ignore
//! let ferry = Ferry::open()?;
//! let handle = ferry.spawn_sync();
//!
//! ferry.engine().save(Table::Patients, record)?;
//! let patient = ferry.cache().lookup_by_natural_key(Table::Patients, "ada@example.com").await?;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cache::ReadThroughCache;
use crate::config::Config;
use crate::identity::DeviceIdentity;
use crate::live::{observe, LiveQuery};
use crate::storage::{LocalStore, StorageResult, Topic};
use crate::sync::{
    spawn_sync_task, EngineConfig, HttpRemote, RemoteApi, RunnerConfig, SyncEngine, SyncHandle,
    Unconfigured,
};

/// Handle to an opened Ferry installation
pub struct Ferry {
    config: Config,
    identity: DeviceIdentity,
    store: Arc<LocalStore>,
    engine: Arc<SyncEngine>,
    cache: ReadThroughCache,
}

impl Ferry {
    /// Open with the default configuration
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open with a specific configuration
    ///
    /// Syncs over HTTP when `sync_enabled` is set and a URL is configured;
    /// otherwise the engine starts offline.
    pub fn open_with_config(config: Config) -> Result<Self> {
        let (remote, online): (Arc<dyn RemoteApi>, bool) = match config.sync_url.as_deref() {
            Some(url) if config.sync_enabled => {
                let remote = HttpRemote::new(url, config.retry_policy().request_timeout)
                    .context("Failed to create sync client")?;
                (Arc::new(remote), true)
            }
            _ => (Arc::new(Unconfigured), false),
        };
        Self::open_with_remote(config, remote, online)
    }

    /// Open with an explicit remote
    pub fn open_with_remote(
        config: Config,
        remote: Arc<dyn RemoteApi>,
        online: bool,
    ) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(&config)
            .context("Failed to load device identity")?;
        let store = Arc::new(LocalStore::open(&config).context("Failed to open local store")?);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            remote,
            identity.device_id(),
            EngineConfig::from_config(&config),
            online,
        ));
        let cache = ReadThroughCache::new(Arc::clone(&engine));

        info!(
            "Opened store at {:?} as device {}",
            config.sqlite_path(),
            identity.device_id()
        );

        Ok(Self {
            config,
            identity,
            store,
            engine,
            cache,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &ReadThroughCache {
        &self.cache
    }

    /// Start the background sync task with the configured timings
    pub fn spawn_sync(&self) -> SyncHandle {
        spawn_sync_task(
            Arc::clone(&self.engine),
            RunnerConfig::from_config(&self.config),
        )
    }

    /// Observe a query over the local store
    pub fn observe<T, F>(&self, topics: impl IntoIterator<Item = Topic>, query: F) -> LiveQuery<T>
    where
        T: Send + Sync + 'static,
        F: Fn(&LocalStore) -> StorageResult<T> + Send + 'static,
    {
        observe(Arc::clone(&self.store), topics, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueueAction, Record, Table};
    use crate::sync::testing::MockRemote;
    use crate::sync::SyncState;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_open_without_sync_url_starts_offline() {
        let temp_dir = TempDir::new().unwrap();
        let ferry = Ferry::open_with_config(test_config(&temp_dir)).unwrap();

        assert_eq!(ferry.engine().state(), SyncState::Offline);
        assert!(ferry.config().sqlite_path().exists());
        assert!(ferry.config().device_id_path().exists());
    }

    #[test]
    fn test_device_id_is_stable_across_opens() {
        let temp_dir = TempDir::new().unwrap();
        let first = Ferry::open_with_config(test_config(&temp_dir))
            .unwrap()
            .device_id()
            .to_string();
        let second = Ferry::open_with_config(test_config(&temp_dir))
            .unwrap()
            .device_id()
            .to_string();

        assert_eq!(first, second);
    }

    #[test]
    fn test_queued_writes_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        {
            let ferry = Ferry::open_with_config(test_config(&temp_dir)).unwrap();
            let record = Record::from_json(json!({"id": "p-1", "email": "a@example.com"})).unwrap();
            ferry
                .engine()
                .enqueue(Table::Patients, record, QueueAction::Create)
                .unwrap();
        }

        let ferry = Ferry::open_with_config(test_config(&temp_dir)).unwrap();
        let pending = ferry.engine().queue_items(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].device_id, ferry.device_id());
    }

    #[tokio::test]
    async fn test_open_with_remote() {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new());
        let ferry =
            Ferry::open_with_remote(test_config(&temp_dir), remote.clone(), true).unwrap();

        ferry
            .engine()
            .save(
                Table::Patients,
                Record::from_json(json!({"id": "p-1", "email": "a@example.com"})).unwrap(),
            )
            .unwrap();
        ferry.engine().flush().await.unwrap();

        assert_eq!(remote.pushed().len(), 1);
        assert_eq!(ferry.engine().state(), SyncState::Idle);
    }
}
