//! HTTP implementation of the remote API
//!
//! Endpoints, relative to the configured sync URL:
//!
//! - `POST /sync/push` with `{"items": [...]}`
//! - `GET /sync/pull?table=<t>&since=<cursor>`
//! - `GET /records/<table>?<field>=<value>`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

use super::remote::{PullPage, PushBatch, RemoteApi, RemoteError, RemoteResult};
use crate::models::{Record, Table};

/// Remote API client over HTTP
pub struct HttpRemote {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRemote {
    /// Create a client; every request is bounded by `timeout`
    pub fn new(base_url: &str, timeout: Duration) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn classify(&self, error: reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else if error.is_decode() {
            RemoteError::Decode(error.to_string())
        } else {
            RemoteError::Network(error.to_string())
        }
    }

    async fn check_status(&self, response: Response) -> RemoteResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn push(&self, batch: &PushBatch) -> RemoteResult<()> {
        debug!("POST /sync/push ({} items)", batch.items.len());
        let response = self
            .client
            .post(self.url("/sync/push"))
            .json(batch)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn pull(&self, table: Table, since: i64) -> RemoteResult<PullPage> {
        debug!("GET /sync/pull table={} since={}", table, since);
        let since = since.to_string();
        let response = self
            .client
            .get(self.url("/sync/pull"))
            .query(&[("table", table.as_str()), ("since", since.as_str())])
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let response = self.check_status(response).await?;
        response.json().await.map_err(|e| self.classify(e))
    }

    async fn find(&self, table: Table, field: &str, value: &str) -> RemoteResult<Vec<Record>> {
        debug!("GET /records/{}?{}=...", table, field);
        let response = self
            .client
            .get(self.url(&format!("/records/{}", table.as_str())))
            .query(&[(field, value)])
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let response = self.check_status(response).await?;
        response.json().await.map_err(|e| self.classify(e))
    }
}
