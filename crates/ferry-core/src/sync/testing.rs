//! In-memory remote for tests
//!
//! [`MockRemote`] scripts push outcomes and pull pages, serves lookups from
//! a fixed record set, and records every call it receives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::remote::{PullPage, PushBatch, RemoteApi, RemoteError, RemoteResult};
use crate::models::{Record, Table};

#[derive(Default)]
struct MockState {
    reachable: bool,
    push_outcomes: VecDeque<RemoteResult<()>>,
    pushed: Vec<PushBatch>,
    pages: HashMap<Table, VecDeque<PullPage>>,
    pull_error: Option<RemoteError>,
    pulls: Vec<(Table, i64)>,
    records: HashMap<Table, Vec<Record>>,
    find_error: Option<RemoteError>,
    find_delay: Option<Duration>,
    finds: Vec<(Table, String, String)>,
}

/// Scriptable [`RemoteApi`] double
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                reachable: true,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When unreachable every call fails with a network error
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Queue the outcome of the next push (pushes default to success)
    pub fn script_push(&self, outcome: RemoteResult<()>) {
        self.state().push_outcomes.push_back(outcome);
    }

    /// Queue a pull page for a table
    ///
    /// Once the script runs out, pulls return an empty page that keeps the
    /// cursor where it is.
    pub fn script_page(&self, table: Table, page: PullPage) {
        self.state().pages.entry(table).or_default().push_back(page);
    }

    /// Make every pull fail with `error` until cleared
    pub fn fail_pulls(&self, error: Option<RemoteError>) {
        self.state().pull_error = error;
    }

    /// Records served by `find`
    pub fn insert_records(&self, table: Table, records: Vec<Record>) {
        self.state().records.entry(table).or_default().extend(records);
    }

    /// Make every lookup fail with `error` until cleared
    pub fn fail_finds(&self, error: Option<RemoteError>) {
        self.state().find_error = error;
    }

    /// Delay lookups, for observing non-blocking callers
    pub fn delay_finds(&self, delay: Option<Duration>) {
        self.state().find_delay = delay;
    }

    /// Every batch received, in order
    pub fn pushed(&self) -> Vec<PushBatch> {
        self.state().pushed.clone()
    }

    /// Every pull request as `(table, since)`
    pub fn pulls(&self) -> Vec<(Table, i64)> {
        self.state().pulls.clone()
    }

    /// Every lookup as `(table, field, value)`
    pub fn finds(&self) -> Vec<(Table, String, String)> {
        self.state().finds.clone()
    }

    fn unreachable() -> RemoteError {
        RemoteError::Network("connection refused".to_string())
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn push(&self, batch: &PushBatch) -> RemoteResult<()> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Self::unreachable());
        }
        let outcome = state.push_outcomes.pop_front().unwrap_or(Ok(()));
        // A network failure means the server never saw the batch
        if !matches!(&outcome, Err(e) if e.is_network()) {
            state.pushed.push(batch.clone());
        }
        outcome
    }

    async fn pull(&self, table: Table, since: i64) -> RemoteResult<PullPage> {
        let mut state = self.state();
        if !state.reachable {
            return Err(Self::unreachable());
        }
        state.pulls.push((table, since));
        if let Some(error) = &state.pull_error {
            return Err(error.clone());
        }
        let page = state
            .pages
            .get_mut(&table)
            .and_then(VecDeque::pop_front)
            .unwrap_or(PullPage {
                records: Vec::new(),
                timestamp: since,
                has_more: false,
            });
        Ok(page)
    }

    async fn find(&self, table: Table, field: &str, value: &str) -> RemoteResult<Vec<Record>> {
        let delay = {
            let mut state = self.state();
            if !state.reachable {
                return Err(Self::unreachable());
            }
            state
                .finds
                .push((table, field.to_string(), value.to_string()));
            if let Some(error) = &state.find_error {
                return Err(error.clone());
            }
            state.find_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        let matches = state
            .records
            .get(&table)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.get_str(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(matches)
    }
}
