//! Live queries
//!
//! [`observe`] runs a query against the local store and re-runs it whenever
//! a committed mutation touches one of its topics, whether the write came
//! from the application or from a pull. Consumers read the latest
//! [`LiveValue`] or await the next one; there is no polling.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::storage::{LocalStore, StorageResult, Topic};

/// Snapshot delivered to consumers
#[derive(Debug, Clone, PartialEq)]
pub struct LiveValue<T> {
    /// Latest result (`None` before the first run completes)
    pub value: Option<T>,
    /// A recompute is in progress
    pub loading: bool,
    /// Error from the latest run; `value` keeps the last good result
    pub error: Option<String>,
}

impl<T> Default for LiveValue<T> {
    fn default() -> Self {
        Self {
            value: None,
            loading: true,
            error: None,
        }
    }
}

/// Handle to a live query; dropping it stops the query
pub struct LiveQuery<T> {
    rx: watch::Receiver<LiveValue<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> LiveQuery<T> {
    /// Latest snapshot
    pub fn current(&self) -> LiveValue<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot; false once the query has stopped
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&LiveValue<T>) -> bool,
    ) -> Option<LiveValue<T>> {
        let value = self.rx.wait_for(predicate).await.ok()?;
        Some((*value).clone())
    }

    /// A receiver for use in `select!` loops
    pub fn receiver(&self) -> watch::Receiver<LiveValue<T>> {
        self.rx.clone()
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Observe a query over the given topics
///
/// Must be called from within a tokio runtime.
pub fn observe<T, F>(
    store: Arc<LocalStore>,
    topics: impl IntoIterator<Item = Topic>,
    query: F,
) -> LiveQuery<T>
where
    T: Send + Sync + 'static,
    F: Fn(&LocalStore) -> StorageResult<T> + Send + 'static,
{
    let topics: HashSet<Topic> = topics.into_iter().collect();
    let (tx, rx) = watch::channel(LiveValue::default());

    // Subscribe before the first run so no change slips between them
    let mut changes = store.subscribe();

    let task = tokio::spawn(async move {
        run_query(&store, &query, &tx);

        loop {
            let relevant = match changes.recv().await {
                Ok(change) => topics.contains(&change.topic),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Live query lagged by {} change(s)", skipped);
                    true
                }
                Err(RecvError::Closed) => break,
            };
            if !relevant {
                continue;
            }

            // Coalesce changes that are already queued
            loop {
                match changes.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }

            if tx.is_closed() {
                break;
            }
            tx.send_modify(|current| current.loading = true);
            run_query(&store, &query, &tx);
        }
    });

    LiveQuery { rx, task }
}

fn run_query<T, F>(store: &LocalStore, query: &F, tx: &watch::Sender<LiveValue<T>>)
where
    F: Fn(&LocalStore) -> StorageResult<T>,
{
    match query(store) {
        Ok(value) => tx.send_modify(|current| {
            current.value = Some(value);
            current.loading = false;
            current.error = None;
        }),
        Err(e) => {
            warn!("Live query failed: {}", e);
            tx.send_modify(|current| {
                current.loading = false;
                current.error = Some(e.to_string());
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Record, Table};
    use crate::sync::ConflictPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn patient(id: &str) -> Record {
        Record::from_json(json!({"id": id, "email": format!("{id}@example.com")})).unwrap()
    }

    fn count_patients(store: Arc<LocalStore>) -> LiveQuery<i64> {
        observe(store, [Topic::Table(Table::Patients)], |store| {
            store.count(Table::Patients)
        })
    }

    #[tokio::test]
    async fn test_initial_value() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        store.put(Table::Patients, &patient("p-1")).unwrap();

        let mut live = count_patients(Arc::clone(&store));
        let value = live.wait_for(|v| !v.loading).await.unwrap();

        assert_eq!(value.value, Some(1));
        assert!(value.error.is_none());
    }

    #[tokio::test]
    async fn test_recomputes_on_local_and_pulled_writes() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let mut live = count_patients(Arc::clone(&store));
        live.wait_for(|v| v.value == Some(0)).await.unwrap();

        store.put(Table::Patients, &patient("p-1")).unwrap();
        live.wait_for(|v| v.value == Some(1)).await.unwrap();

        store
            .merge_pulled(
                Table::Patients,
                &[patient("p-2"), patient("p-3")],
                ConflictPolicy::ArrivalOrder,
            )
            .unwrap();
        let value = live.wait_for(|v| v.value == Some(3)).await.unwrap();
        assert!(!value.loading);
    }

    #[tokio::test]
    async fn test_unrelated_tables_do_not_recompute() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut live = observe(
            Arc::clone(&store),
            [Topic::Table(Table::Patients)],
            move |store| {
                counter.fetch_add(1, Ordering::SeqCst);
                store.count(Table::Patients)
            },
        );
        live.wait_for(|v| !v.loading).await.unwrap();

        store
            .put(
                Table::Messages,
                &Record::from_json(json!({"id": "m-1", "patient_id": "p-1"})).unwrap(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_topic() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let mut live = observe(Arc::clone(&store), [Topic::Queue], |store| {
            store.pending_count()
        });
        live.wait_for(|v| v.value == Some(0)).await.unwrap();

        store
            .write_and_enqueue(
                Table::Patients,
                &patient("p-1"),
                crate::models::QueueAction::Create,
                "device-a",
            )
            .unwrap();

        live.wait_for(|v| v.value == Some(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_stops_the_query() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let live = count_patients(Arc::clone(&store));
        let mut rx = live.receiver();
        drop(live);

        // The sender goes away with the aborted task
        let _ = rx.changed().await;
        assert!(rx.changed().await.is_err());
    }
}
