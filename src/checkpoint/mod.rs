//! Checkpoint ledger for resumable bulk loads.
//!
//! Provides:
//! - `CheckpointsDb`: the ledger contract (task, table, engine, chunk levels)
//! - `FileCheckpointsDb`: JSON file driver with atomic replace
//! - `NullCheckpointsDb`: used when checkpoints are disabled
//! - `open_checkpoints_db` / `is_checkpoints_db_exists`: driver selection

mod dump;
mod file;
mod null;

pub use file::*;
pub use null::*;

use crate::models::{
    CheckpointDiff, CheckpointDriver, Config, DestroyedTableCheckpoint, EngineCheckpoint,
    Result, TableCheckpoint, TableName, TableScope, TaskCheckpoint,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;

/// Durable progress ledger.
///
/// No method retries: failures surface immediately with their cause.
#[async_trait]
pub trait CheckpointsDb: Send + Sync {
    /// Record the task (once) and a `Loaded` row for every table not yet known.
    async fn initialize(&self, task: &TaskCheckpoint, tables: &[TableName]) -> Result<()>;

    /// The recorded task, or the zero value when uninitialized.
    async fn task_checkpoint(&self) -> Result<TaskCheckpoint>;

    async fn table_checkpoint(&self, table: &TableName) -> Result<Option<TableCheckpoint>>;

    async fn insert_engine_checkpoints(
        &self,
        table: &TableName,
        engines: Vec<EngineCheckpoint>,
    ) -> Result<()>;

    /// Merge progress for one table. Status only moves forward.
    async fn update(&self, table: &TableName, diff: &CheckpointDiff) -> Result<()>;

    /// Delete every row in scope. Removing from an empty ledger is a no-op.
    async fn remove_checkpoint(&self, scope: &TableScope) -> Result<()>;

    /// Clear recorded errors in scope so a resumed run retries them.
    async fn ignore_error_checkpoint(&self, scope: &TableScope) -> Result<()>;

    /// Delete every errored table in scope, returning what was deleted.
    ///
    /// Fails with `NoErrorRecorded` when nothing matched.
    async fn destroy_error_checkpoint(
        &self,
        scope: &TableScope,
    ) -> Result<Vec<DestroyedTableCheckpoint>>;

    async fn dump_tables(&self, sink: &mut (dyn Write + Send)) -> Result<()>;

    async fn dump_engines(&self, sink: &mut (dyn Write + Send)) -> Result<()>;

    async fn dump_chunks(&self, sink: &mut (dyn Write + Send)) -> Result<()>;

    /// Tables with engine data that exists only in local intermediate files.
    async fn get_local_storing_tables(&self) -> Result<BTreeMap<TableName, Vec<i32>>>;

    /// Flush and release the ledger.
    async fn close(&self) -> Result<()>;
}

/// Open the ledger selected by the config.
pub async fn open_checkpoints_db(config: &Config) -> Result<Box<dyn CheckpointsDb>> {
    if !config.checkpoint.enable {
        return Ok(Box::new(NullCheckpointsDb));
    }
    match config.checkpoint.driver {
        CheckpointDriver::File => Ok(Box::new(FileCheckpointsDb::open(&config.checkpoint.path)?)),
    }
}

/// Whether a ledger exists, without creating one.
pub async fn is_checkpoints_db_exists(config: &Config) -> Result<bool> {
    if !config.checkpoint.enable {
        return Ok(false);
    }
    match config.checkpoint.driver {
        CheckpointDriver::File => Ok(config.checkpoint.path.exists()),
    }
}
