//! Placement-driver client: the coordinator that knows every storage node.

use crate::client::http::{base_url, build_http_client, check_status, classify};
use crate::models::{ClusterConfig, LodeError, Result, SecurityConfig, Store, StoreState};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Source of the current storage-node list.
#[async_trait]
pub trait StoreDirectory: Send + Sync {
    /// Every node the coordinator knows about, in any state.
    ///
    /// A failure here is fatal for fleet commands: without the list no node
    /// can be addressed.
    async fn list_stores(&self) -> Result<Vec<Store>>;
}

#[derive(Debug, Deserialize)]
struct StoresResponse {
    #[serde(default)]
    count: usize,
    #[serde(default)]
    stores: Vec<StoreEntry>,
}

#[derive(Debug, Deserialize)]
struct StoreEntry {
    store: StoreMeta,
}

#[derive(Debug, Deserialize)]
struct StoreMeta {
    id: u64,
    address: String,
    #[serde(default)]
    state_name: String,
    #[serde(default)]
    version: String,
}

impl From<StoreMeta> for Store {
    fn from(meta: StoreMeta) -> Self {
        Store {
            id: meta.id,
            address: meta.address,
            state: StoreState::from_state_name(&meta.state_name),
            version: meta.version,
        }
    }
}

/// HTTP client for the placement driver.
pub struct PdClient {
    client: reqwest::Client,
    base_url: String,
}

impl PdClient {
    pub fn new(cluster: &ClusterConfig, security: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(security, cluster.timeout())?,
            base_url: base_url(security, &cluster.pd_addr),
        })
    }
}

#[async_trait]
impl StoreDirectory for PdClient {
    async fn list_stores(&self) -> Result<Vec<Store>> {
        let url = format!("{}/pd/api/v1/stores", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify("placement driver", e))?;

        let body: StoresResponse = check_status(response)
            .await
            .map_err(|e| LodeError::BackendUnavailable {
                what: format!("placement driver at {}", self.base_url),
                source: Some(Box::new(e)),
            })?
            .json()
            .await
            .map_err(|e| LodeError::Parse(format!("Failed to parse store list: {e}")))?;

        debug!(count = body.count, listed = body.stores.len(), "Fetched store list");
        Ok(body.stores.into_iter().map(|entry| entry.store.into()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_list() {
        let json = r#"{
            "count": 2,
            "stores": [
                {"store": {"id": 1, "address": "10.0.0.1:20160", "state_name": "Up", "version": "7.5.0"},
                 "status": {"capacity": "1TiB"}},
                {"store": {"id": 4, "address": "10.0.0.2:20160", "state_name": "Tombstone"}}
            ]
        }"#;
        let body: StoresResponse = serde_json::from_str(json).unwrap();
        let stores: Vec<Store> = body.stores.into_iter().map(|e| e.store.into()).collect();

        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].state, StoreState::Up);
        assert_eq!(stores[0].version, "7.5.0");
        assert_eq!(stores[1].id, 4);
        assert_eq!(stores[1].state, StoreState::Tombstone);
        assert!(stores[1].version.is_empty());
    }
}
