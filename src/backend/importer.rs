//! Backend whose engines live in a remote importer service.

use super::{CleanupStrategy, ImportBackend, KvPair};
use crate::client::{base_url, build_http_client, check_status, classify};
use crate::models::{Config, LodeError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    pairs: &'a [KvPair],
}

#[derive(Debug, Serialize)]
struct ImportRequest<'a> {
    pd_addr: &'a str,
    region_split_size: u64,
}

/// Talks to the importer over `POST /engines/{uuid}/{action}`.
pub struct RemoteImporterBackend {
    client: reqwest::Client,
    base_url: String,
    pd_addr: String,
}

impl RemoteImporterBackend {
    pub fn new(config: &Config) -> Result<Self> {
        if config.importer.addr.trim().is_empty() {
            return Err(LodeError::Config(crate::models::ConfigError::Missing(
                "importer.addr",
            )));
        }
        let timeout = Duration::from_secs(config.importer.timeout_secs);
        Ok(Self {
            client: build_http_client(&config.security, timeout)?,
            base_url: base_url(&config.security, &config.importer.addr),
            pd_addr: config.cluster.pd_addr.clone(),
        })
    }

    async fn call<B: Serialize + ?Sized + Sync>(
        &self,
        uuid: Uuid,
        action: &str,
        body: &B,
        missing_ok: bool,
    ) -> Result<()> {
        let url = format!("{}/engines/{}/{}", self.base_url, uuid, action);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| classify("importer", e))?;

        if missing_ok && response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(%uuid, action, "Importer does not know the engine");
            return Ok(());
        }
        check_status(response).await?;
        debug!(%uuid, action, "Importer call succeeded");
        Ok(())
    }
}

#[async_trait]
impl ImportBackend for RemoteImporterBackend {
    fn name(&self) -> &'static str {
        "importer"
    }

    fn cleanup_strategy(&self) -> CleanupStrategy {
        CleanupStrategy::CloseThenCleanup
    }

    async fn open_engine(&self, uuid: Uuid) -> Result<()> {
        self.call(uuid, "open", &json!({}), false).await
    }

    async fn write_rows(&self, uuid: Uuid, pairs: Vec<KvPair>) -> Result<()> {
        self.call(uuid, "write", &WriteRequest { pairs: &pairs }, false)
            .await
    }

    async fn close_engine(&self, uuid: Uuid) -> Result<()> {
        self.call(uuid, "close", &json!({}), true).await
    }

    async fn import_engine(
        &self,
        cancel: &CancellationToken,
        uuid: Uuid,
        region_split_size: u64,
    ) -> Result<()> {
        let request = ImportRequest {
            pd_addr: &self.pd_addr,
            region_split_size,
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(LodeError::Cancelled),
            result = self.call(uuid, "import", &request, false) => result,
        }
    }

    async fn cleanup_engine(&self, uuid: Uuid) -> Result<()> {
        self.call(uuid, "cleanup", &json!({}), true).await
    }
}
