//! Sync status and its subscribers
//!
//! The engine publishes every state transition here. Callers register a
//! callback and get a [`SubscriptionId`] back for unsubscribing; async
//! consumers can use the watch channel from [`StatusBus::watch`] instead.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Online with nothing in flight
    Idle,
    /// A flush or pull is running
    Syncing,
    /// Connectivity lost; items stay pending
    Offline,
    /// The last operation failed without making progress
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub state: SyncState,
    /// Human-readable detail
    pub detail: Option<String>,
}

/// Token returned by [`StatusBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Current state plus registered listeners
pub struct StatusBus {
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
    current: watch::Sender<StatusUpdate>,
}

impl StatusBus {
    pub fn new(initial: SyncState) -> Self {
        let (current, _) = watch::channel(StatusUpdate {
            state: initial,
            detail: None,
        });
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            current,
        }
    }

    /// Current state
    pub fn state(&self) -> SyncState {
        self.current.borrow().state
    }

    /// Latest update, including its detail
    pub fn latest(&self) -> StatusUpdate {
        self.current.borrow().clone()
    }

    /// Register a callback invoked on every transition
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback, returning whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Receiver that always holds the latest update
    pub fn watch(&self) -> watch::Receiver<StatusUpdate> {
        self.current.subscribe()
    }

    /// Publish a transition to every subscriber
    pub fn publish(&self, state: SyncState, detail: Option<String>) {
        let update = StatusUpdate { state, detail };
        debug!("Sync state -> {} {:?}", update.state, update.detail);
        self.current.send_replace(update.clone());

        // Callbacks run outside the lock so they may unsubscribe themselves
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&update);
        }
    }
}
