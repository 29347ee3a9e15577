//! Import backends and the engine lifecycle.
//!
//! An engine is a batch of sorted key/value data for one table (or one of
//! its indexes). Engines are written, closed, imported into the storage
//! fleet, and finally cleaned up. Two backends exist:
//! - `RemoteImporterBackend`: engines live inside a remote importer service
//! - `LocalFileBackend`: engines are segment files under a local directory
//!
//! Recovery code only sees `ImportBackend`; the concrete backend is chosen
//! once from the config by [`backend_from_config`].

mod engine;
mod importer;
mod local;

pub use engine::*;
pub use importer::*;
pub use local::*;

use crate::models::{BackendKind, Config, LodeError, Result, TableName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Namespace for deriving engine UUIDs. Changing it orphans every engine
/// written by earlier versions.
pub const ENGINE_NAMESPACE: Uuid = Uuid::from_u128(0xd68d6abe_c59e_45d6_ade8_e2b0ceb7bedf);

/// One key/value pair destined for the storage fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// How error-destroy gets rid of an engine's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStrategy {
    /// The engine lives in a long-running service: force-close it, then ask
    /// the service to clean it up.
    CloseThenCleanup,
    /// The engine is a directory under this path: delete it. No live
    /// backend is needed.
    RemoveLocalFiles(PathBuf),
}

/// Contract every import backend fulfils. All engine calls are keyed by the
/// engine UUID from [`make_uuid`].
#[async_trait]
pub trait ImportBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn cleanup_strategy(&self) -> CleanupStrategy;

    async fn open_engine(&self, uuid: Uuid) -> Result<()>;

    async fn write_rows(&self, uuid: Uuid, pairs: Vec<KvPair>) -> Result<()>;

    /// Close an engine for writing. Closing an engine the backend no longer
    /// knows is not an error.
    async fn close_engine(&self, uuid: Uuid) -> Result<()>;

    /// Ingest a closed engine into the fleet in ranges of roughly
    /// `region_split_size` bytes. Importing an already-imported engine is a
    /// no-op.
    async fn import_engine(
        &self,
        cancel: &CancellationToken,
        uuid: Uuid,
        region_split_size: u64,
    ) -> Result<()>;

    /// Release every resource of the engine. Cleaning up a missing engine
    /// succeeds.
    async fn cleanup_engine(&self, uuid: Uuid) -> Result<()>;
}

/// Build the backend selected in the config.
pub fn backend_from_config(config: &Config) -> Result<Arc<dyn ImportBackend>> {
    match config.importer.backend {
        BackendKind::Importer => Ok(Arc::new(RemoteImporterBackend::new(config)?)),
        BackendKind::Local => Ok(Arc::new(LocalFileBackend::from_config(config)?)),
    }
}

/// Derive the tag and UUID of an engine.
///
/// The tag is `"<table>:<engine_id>"` with the table in its quoted
/// `` `db`.`tbl` `` form; the UUID is a v5 UUID of the tag.
pub fn make_uuid(table: &TableName, engine_id: i32) -> (String, Uuid) {
    let tag = format!("{table}:{engine_id}");
    let uuid = Uuid::new_v5(&ENGINE_NAMESPACE, tag.as_bytes());
    (tag, uuid)
}

/// Operator-supplied reference to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRef {
    /// `` `db`.`tbl`:engine_id ``
    Table { table: TableName, engine_id: i32 },
    /// A bare engine UUID
    Uuid(Uuid),
}

impl EngineRef {
    /// Parse `table:engine_id` (split at the last colon) or a bare UUID.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((table, engine_id)) = s.rsplit_once(':') {
            let engine_id: i32 = engine_id.trim().parse().map_err(|_| {
                LodeError::InvalidArgument(format!("invalid engine id '{engine_id}' in '{s}'"))
            })?;
            let table: TableName = table.parse()?;
            return Ok(Self::Table { table, engine_id });
        }

        Uuid::parse_str(s.trim())
            .map(Self::Uuid)
            .map_err(|e| LodeError::InvalidArgument(format!("invalid engine uuid '{s}': {e}")))
    }

    /// Tag and UUID this reference resolves to.
    pub fn resolve(&self) -> (String, Uuid) {
        match self {
            Self::Table { table, engine_id } => make_uuid(table, *engine_id),
            Self::Uuid(uuid) => (uuid.to_string(), *uuid),
        }
    }
}
