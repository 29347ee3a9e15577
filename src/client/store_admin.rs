//! Administrative calls against a single storage node.

use crate::client::http::{build_http_client, check_status, classify};
use crate::models::{ClusterConfig, LodeError, Result, SecurityConfig, SwitchMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Per-node administrative operations.
#[async_trait]
pub trait StoreAdmin: Send + Sync {
    /// Switch the node's write-path tuning.
    async fn switch_mode(&self, address: &str, mode: SwitchMode) -> Result<()>;

    /// Trigger compaction down to `level` (`FULL_LEVEL_COMPACT` for all).
    async fn compact(&self, address: &str, level: i32) -> Result<()>;

    /// Read the node's current mode.
    async fn fetch_mode(&self, address: &str) -> Result<SwitchMode>;
}

#[derive(Debug, Serialize)]
struct SwitchModeRequest {
    mode: SwitchMode,
}

#[derive(Debug, Serialize)]
struct CompactRequest {
    output_level: i32,
}

#[derive(Debug, Deserialize)]
struct ModeResponse {
    mode: SwitchMode,
}

/// HTTP implementation of [`StoreAdmin`].
///
/// Transport failures and 5xx answers are retried with exponential backoff;
/// 4xx answers are returned immediately.
pub struct HttpStoreAdmin {
    client: reqwest::Client,
    scheme: &'static str,
    max_retries: u32,
}

impl HttpStoreAdmin {
    pub fn new(cluster: &ClusterConfig, security: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(security, cluster.timeout())?,
            scheme: security.scheme(),
            max_retries: cluster.max_retries.max(1),
        })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, address, path)
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut last_error: Option<LodeError> = None;

        for attempt in 0..self.max_retries {
            let error = match build().send().await {
                Ok(response) => match check_status(response).await {
                    Ok(response) => return Ok(response),
                    Err(LodeError::Remote { status, message }) if status < 500 => {
                        return Err(LodeError::Remote { status, message });
                    }
                    Err(e) => e,
                },
                Err(e) => classify("storage node", e),
            };
            last_error = Some(error);

            if attempt + 1 < self.max_retries {
                let backoff = Duration::from_secs(2u64.pow(attempt));
                debug!(
                    attempt = attempt,
                    backoff_secs = backoff.as_secs(),
                    "Retrying store request"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| LodeError::Internal("no attempt was made".into())))
    }
}

#[async_trait]
impl StoreAdmin for HttpStoreAdmin {
    async fn switch_mode(&self, address: &str, mode: SwitchMode) -> Result<()> {
        let url = self.url(address, "/import/switch-mode");
        self.send_with_retry(|| self.client.post(&url).json(&SwitchModeRequest { mode }))
            .await?;
        debug!(address, %mode, "Switched mode");
        Ok(())
    }

    async fn compact(&self, address: &str, level: i32) -> Result<()> {
        let url = self.url(address, "/import/compact");
        self.send_with_retry(|| {
            self.client
                .post(&url)
                .json(&CompactRequest { output_level: level })
        })
        .await?;
        debug!(address, level, "Compaction requested");
        Ok(())
    }

    async fn fetch_mode(&self, address: &str) -> Result<SwitchMode> {
        let url = self.url(address, "/import/mode");
        let body: ModeResponse = self
            .send_with_retry(|| self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|e| LodeError::Parse(format!("Failed to parse mode of {address}: {e}")))?;
        Ok(body.mode)
    }
}
