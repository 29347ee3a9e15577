//! File-backed checkpoint ledger.
//!
//! - The whole ledger is one JSON document
//! - State is persisted atomically (write temp file, then rename)
//! - The previous document is kept as `<path>.bak` before each save
//! - A missing file is an empty ledger

use super::dump;
use super::CheckpointsDb;
use crate::models::{
    CheckpointDiff, CheckpointStatus, DestroyedTableCheckpoint, EngineCheckpoint, LodeError,
    Result, TableCheckpoint, TableName, TableScope, TaskCheckpoint,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// On-disk layout of the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointsModel {
    #[serde(default)]
    task: TaskCheckpoint,
    #[serde(default)]
    tables: BTreeMap<TableName, TableCheckpoint>,
}

/// Checkpoint ledger stored in a single JSON file.
pub struct FileCheckpointsDb {
    /// Path to main checkpoint file
    path: PathBuf,
    /// Path to backup file
    backup_path: PathBuf,
    /// Path written before the atomic rename
    temp_path: PathBuf,
    /// Current state; the mutex serializes writers inside this process
    model: Mutex<CheckpointsModel>,
}

impl FileCheckpointsDb {
    /// Open the ledger at `path`, loading it if present.
    pub fn open(path: &Path) -> Result<Self> {
        let model = match File::open(path) {
            Ok(file) => {
                let reader = BufReader::new(file);
                let model: CheckpointsModel = serde_json::from_reader(reader).map_err(|e| {
                    LodeError::Parse(format!("Invalid checkpoint file {}: {e}", path.display()))
                })?;
                info!(
                    path = %path.display(),
                    tables = model.tables.len(),
                    task_id = model.task.task_id,
                    "Loaded checkpoints"
                );
                model
            }
            Err(e) if e.kind() == ErrorKind::NotFound => CheckpointsModel::default(),
            Err(e) => {
                return Err(LodeError::unavailable(
                    format!("checkpoint file {}", path.display()),
                    e,
                ))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            backup_path: sibling(path, "bak"),
            temp_path: sibling(path, "tmp"),
            model: Mutex::new(model),
        })
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, CheckpointsModel>> {
        self.model
            .lock()
            .map_err(|_| LodeError::Internal("checkpoint state lock poisoned".to_string()))
    }

    /// Save the ledger to disk (atomic write).
    fn save(&self, model: &CheckpointsModel) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| LodeError::io("creating checkpoint dir", e))?;
        }

        // Backup existing checkpoint
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| LodeError::io("backing up checkpoint", e))?;
        }

        {
            let file = File::create(&self.temp_path)
                .map_err(|e| LodeError::io("creating temp checkpoint", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, model)
                .map_err(|e| LodeError::Internal(format!("Serializing checkpoint: {e}")))?;
            writer
                .flush()
                .map_err(|e| LodeError::io("flushing temp checkpoint", e))?;
        }

        fs::rename(&self.temp_path, &self.path)
            .map_err(|e| LodeError::io("renaming checkpoint", e))?;

        debug!(path = %self.path.display(), "Checkpoint saved");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn table_names(&self) -> Result<Vec<TableName>> {
        Ok(self.lock()?.tables.keys().cloned().collect())
    }

    /// Run `f` on the ledger and persist the result.
    fn mutate<R>(&self, f: impl FnOnce(&mut CheckpointsModel) -> Result<R>) -> Result<R> {
        let mut model = self.lock()?;
        let out = f(&mut *model)?;
        self.save(&*model)?;
        Ok(out)
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LodeError::io(format!("removing {}", path.display()), e)),
    }
}

#[async_trait]
impl CheckpointsDb for FileCheckpointsDb {
    async fn initialize(&self, task: &TaskCheckpoint, tables: &[TableName]) -> Result<()> {
        self.mutate(|model| {
            if !model.task.is_initialized() {
                model.task = task.clone();
            }
            for name in tables {
                model
                    .tables
                    .entry(name.clone())
                    .or_insert_with(|| TableCheckpoint::new(name.clone()));
            }
            Ok(())
        })
    }

    async fn task_checkpoint(&self) -> Result<TaskCheckpoint> {
        Ok(self.lock()?.task.clone())
    }

    async fn table_checkpoint(&self, table: &TableName) -> Result<Option<TableCheckpoint>> {
        Ok(self.lock()?.tables.get(table).cloned())
    }

    async fn insert_engine_checkpoints(
        &self,
        table: &TableName,
        engines: Vec<EngineCheckpoint>,
    ) -> Result<()> {
        self.mutate(|model| {
            let cp = model
                .tables
                .get_mut(table)
                .ok_or_else(|| LodeError::NotFound(format!("table {table}")))?;
            for engine in engines {
                cp.engines.insert(engine.engine_id, engine);
            }
            Ok(())
        })
    }

    async fn update(&self, table: &TableName, diff: &CheckpointDiff) -> Result<()> {
        self.mutate(|model| {
            let cp = model
                .tables
                .get_mut(table)
                .ok_or_else(|| LodeError::NotFound(format!("table {table}")))?;
            diff.apply_to(cp);
            Ok(())
        })
    }

    async fn remove_checkpoint(&self, scope: &TableScope) -> Result<()> {
        let mut model = self.lock()?;
        match scope {
            TableScope::All => {
                *model = CheckpointsModel::default();
                remove_if_exists(&self.path)?;
                remove_if_exists(&self.backup_path)?;
                info!("Removed all checkpoints");
                Ok(())
            }
            TableScope::Table(name) => {
                if model.tables.remove(name).is_none() {
                    debug!(table = %name, "No checkpoint to remove");
                    return Ok(());
                }
                self.save(&*model)?;
                info!(table = %name, "Removed table checkpoint");
                Ok(())
            }
        }
    }

    async fn ignore_error_checkpoint(&self, scope: &TableScope) -> Result<()> {
        let mut model = self.lock()?;
        let mut cleared = 0usize;
        for table in model.tables.values_mut() {
            if !scope.matches(&table.table_name) {
                continue;
            }
            if table.failed {
                table.failed = false;
                table.status = CheckpointStatus::Loaded;
                cleared += 1;
                info!(table = %table.table_name, "Cleared table error");
            }
            for engine in table.engines.values_mut().filter(|e| e.failed) {
                engine.failed = false;
                engine.status = CheckpointStatus::Loaded;
                cleared += 1;
            }
        }
        if cleared == 0 {
            debug!(scope = %scope, "No checkpoint error to clear");
            return Ok(());
        }
        self.save(&*model)
    }

    async fn destroy_error_checkpoint(
        &self,
        scope: &TableScope,
    ) -> Result<Vec<DestroyedTableCheckpoint>> {
        let mut model = self.lock()?;
        let targets: Vec<DestroyedTableCheckpoint> = model
            .tables
            .values()
            .filter(|t| t.failed && scope.matches(&t.table_name))
            .map(|t| DestroyedTableCheckpoint {
                table_name: t.table_name.clone(),
                // no engines gives an empty range (min > max)
                min_engine_id: t.min_engine_id().unwrap_or(i32::MAX),
                max_engine_id: t.max_engine_id().unwrap_or(i32::MIN),
            })
            .collect();

        if targets.is_empty() {
            return Err(LodeError::NoErrorRecorded(scope.to_string()));
        }

        for target in &targets {
            model.tables.remove(&target.table_name);
        }
        self.save(&*model)?;
        info!(count = targets.len(), "Destroyed errored table checkpoints");
        Ok(targets)
    }

    async fn dump_tables(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let model = self.lock()?;
        dump::write_tables(&model.task, model.tables.values(), sink)
    }

    async fn dump_engines(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let model = self.lock()?;
        dump::write_engines(model.tables.values(), sink)
    }

    async fn dump_chunks(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let model = self.lock()?;
        dump::write_chunks(model.tables.values(), sink)
    }

    async fn get_local_storing_tables(&self) -> Result<BTreeMap<TableName, Vec<i32>>> {
        let model = self.lock()?;
        let mut result = BTreeMap::new();
        for table in model.tables.values() {
            if table.failed || table.status >= CheckpointStatus::Imported {
                continue;
            }
            let engines: Vec<i32> = table
                .engines
                .values()
                .filter(|e| !e.failed && e.status < CheckpointStatus::Imported)
                .filter(|e| e.chunks.iter().any(|c| c.has_progress()))
                .map(|e| e.engine_id)
                .collect();
            if !engines.is_empty() {
                result.insert(table.table_name.clone(), engines);
            }
        }
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        debug!(path = %self.path.display(), "Closing checkpoints");
        remove_if_exists(&self.temp_path)
    }
}
