//! HTTP client for the pool API.

pub mod types;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;

use types::{BlockState, PaymentState, PoolStats, WorkerState};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

/// Typed client for the v0 API.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/api/v0{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{url}: {status}: {body}");
        }
        response
            .json()
            .await
            .with_context(|| format!("invalid response from {url}"))
    }

    pub async fn get_stats(&self) -> Result<PoolStats> {
        self.get("/stats").await
    }

    pub async fn get_worker(&self, address: &str) -> Result<WorkerState> {
        self.get(&format!("/workers/{address}")).await
    }

    pub async fn get_worker_payments(&self, address: &str) -> Result<Vec<PaymentState>> {
        self.get(&format!("/workers/{address}/payments")).await
    }

    pub async fn get_blocks(&self, limit: usize) -> Result<Vec<BlockState>> {
        self.get(&format!("/blocks?limit={limit}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = Client::with_base_url("http://pool.local:8080/");
        assert_eq!(client.base_url, "http://pool.local:8080");
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let client = Client::with_base_url("http://127.0.0.1:1");
        assert!(client.get_stats().await.is_err());
    }
}
