//! Remote API seam
//!
//! The engine and the read-through cache only talk to the server through
//! [`RemoteApi`]. [`super::HttpRemote`] is the production implementation;
//! unit tests use an in-memory `MockRemote`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{QueueItem, Record, Table};

/// Errors from remote calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never got a response
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded its timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with a non-success status
    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// The response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Connectivity-level failure (as opposed to a server answer)
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Body of a push request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushBatch {
    pub items: Vec<QueueItem>,
}

/// One page of a pull
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullPage {
    pub records: Vec<Record>,
    /// New cursor value
    pub timestamp: i64,
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
}

/// Operations the server exposes
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Push a batch of queue items; the batch succeeds or fails as a whole
    async fn push(&self, batch: &PushBatch) -> RemoteResult<()>;

    /// Changes to `table` since the cursor
    async fn pull(&self, table: Table, since: i64) -> RemoteResult<PullPage>;

    /// Records of `table` whose `field` equals `value`
    ///
    /// For natural key lookups the first record is authoritative.
    async fn find(&self, table: Table, field: &str, value: &str) -> RemoteResult<Vec<Record>>;
}

/// Remote used when no sync URL is configured; every call is a network error
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

impl Unconfigured {
    fn error() -> RemoteError {
        RemoteError::Network("sync is not configured".to_string())
    }
}

#[async_trait]
impl RemoteApi for Unconfigured {
    async fn push(&self, _batch: &PushBatch) -> RemoteResult<()> {
        Err(Self::error())
    }

    async fn pull(&self, _table: Table, _since: i64) -> RemoteResult<PullPage> {
        Err(Self::error())
    }

    async fn find(&self, _table: Table, _field: &str, _value: &str) -> RemoteResult<Vec<Record>> {
        Err(Self::error())
    }
}
