//! Ledger used when checkpoints are disabled: remembers nothing.

use super::{dump, CheckpointsDb};
use crate::models::{
    CheckpointDiff, DestroyedTableCheckpoint, EngineCheckpoint, LodeError, Result,
    TableCheckpoint, TableName, TableScope, TaskCheckpoint,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;

pub struct NullCheckpointsDb;

#[async_trait]
impl CheckpointsDb for NullCheckpointsDb {
    async fn initialize(&self, _task: &TaskCheckpoint, _tables: &[TableName]) -> Result<()> {
        Ok(())
    }

    async fn task_checkpoint(&self) -> Result<TaskCheckpoint> {
        Ok(TaskCheckpoint::default())
    }

    async fn table_checkpoint(&self, _table: &TableName) -> Result<Option<TableCheckpoint>> {
        Ok(None)
    }

    async fn insert_engine_checkpoints(
        &self,
        _table: &TableName,
        _engines: Vec<EngineCheckpoint>,
    ) -> Result<()> {
        Ok(())
    }

    async fn update(&self, _table: &TableName, _diff: &CheckpointDiff) -> Result<()> {
        Ok(())
    }

    async fn remove_checkpoint(&self, _scope: &TableScope) -> Result<()> {
        Ok(())
    }

    async fn ignore_error_checkpoint(&self, _scope: &TableScope) -> Result<()> {
        Ok(())
    }

    async fn destroy_error_checkpoint(
        &self,
        scope: &TableScope,
    ) -> Result<Vec<DestroyedTableCheckpoint>> {
        Err(LodeError::NoErrorRecorded(scope.to_string()))
    }

    async fn dump_tables(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        dump::write_tables(&TaskCheckpoint::default(), std::iter::empty(), sink)
    }

    async fn dump_engines(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        dump::write_engines(std::iter::empty(), sink)
    }

    async fn dump_chunks(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        dump::write_chunks(std::iter::empty(), sink)
    }

    async fn get_local_storing_tables(&self) -> Result<BTreeMap<TableName, Vec<i32>>> {
        Ok(BTreeMap::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
