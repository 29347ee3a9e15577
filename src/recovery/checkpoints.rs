//! Verbs acting on the checkpoint ledger and what it points at.

use super::CommandContext;
use crate::backend::{make_uuid, CleanupStrategy, EngineManager, LocalFileBackend};
use crate::checkpoint::CheckpointsDb;
use crate::models::{DestroyedTableCheckpoint, LodeError, Result, TableScope};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

const NO_LOST_FILES: &str = "No table has lost intermediate files according to given config";

/// Close the ledger on every exit path. The command's own error wins over a
/// close error.
async fn close_after<T>(cpdb: Box<dyn CheckpointsDb>, result: Result<T>) -> Result<T> {
    let closed = cpdb.close().await;
    let value = result?;
    closed?;
    Ok(value)
}

/// Drop checkpoint rows in scope, cleaning load metadata on the target first
/// when a task was recorded.
pub async fn checkpoint_remove(ctx: &CommandContext, scope: &TableScope) -> Result<()> {
    let cpdb = ctx.connector().checkpoints(&ctx.config).await?;
    let result = remove(ctx, cpdb.as_ref(), scope).await;
    close_after(cpdb, result).await
}

async fn remove(ctx: &CommandContext, cpdb: &dyn CheckpointsDb, scope: &TableScope) -> Result<()> {
    let task = cpdb.task_checkpoint().await?;
    if task.is_initialized() {
        let target = ctx.connector().target(&ctx.config).await?;
        let cleaned = target
            .cleanup_metas(scope, &ctx.config.app.meta_schema_name)
            .await;
        target.close().await;
        cleaned?;
    }
    cpdb.remove_checkpoint(scope).await?;
    info!(scope = %scope, "Removed checkpoints");
    Ok(())
}

/// Clear recorded errors so a resumed load retries the tables.
pub async fn checkpoint_error_ignore(ctx: &CommandContext, scope: &TableScope) -> Result<()> {
    let cpdb = ctx.connector().checkpoints(&ctx.config).await?;
    let result = cpdb.ignore_error_checkpoint(scope).await;
    if result.is_ok() {
        info!(scope = %scope, "Cleared checkpoint errors");
    }
    close_after(cpdb, result).await
}

/// Throw away every errored table in scope: its checkpoint rows, the target
/// table, and its engines. Nothing to destroy is a success.
pub async fn checkpoint_error_destroy(ctx: &CommandContext, scope: &TableScope) -> Result<()> {
    let cpdb = ctx.connector().checkpoints(&ctx.config).await?;
    let result = destroy(ctx, cpdb.as_ref(), scope).await;
    close_after(cpdb, result).await
}

async fn destroy(ctx: &CommandContext, cpdb: &dyn CheckpointsDb, scope: &TableScope) -> Result<()> {
    // Connect before deleting rows: once the rows are gone a re-run can no
    // longer find what to drop.
    let target = ctx.connector().target(&ctx.config).await?;
    let backend = match ctx.connector().import_backend(&ctx.config) {
        Ok(backend) => backend,
        Err(e) => {
            target.close().await;
            return Err(e);
        }
    };

    let tables = match cpdb.destroy_error_checkpoint(scope).await {
        Ok(tables) => tables,
        Err(e) if e.is_not_found() => {
            info!(scope = %scope, "No errored table to destroy");
            target.close().await;
            return Ok(());
        }
        Err(e) => {
            target.close().await;
            return Err(e);
        }
    };

    let mut last_err: Option<LodeError> = None;

    for table in &tables {
        ctx.say(format_args!("Dropping table: {}", table.table_name));
        if let Err(e) = target.drop_table(&table.table_name).await {
            ctx.say(format_args!("* Encountered error while dropping table: {e}"));
            warn!(table = %table.table_name, error = %e, "Drop table failed");
            last_err = Some(e);
        }
    }

    let engine_count: u64 = tables.iter().map(|t| t.engine_ids().count() as u64).sum();
    let pb = ctx.progress_bar(engine_count, "Cleaning up engines");

    let outcome = match backend.cleanup_strategy() {
        CleanupStrategy::CloseThenCleanup => {
            let manager = EngineManager::new(backend);
            close_and_cleanup(ctx, &manager, &tables, &pb, &mut last_err).await
        }
        CleanupStrategy::RemoveLocalFiles(dir) => {
            remove_engine_dirs(ctx, &dir, &tables, &pb, &mut last_err);
            Ok(())
        }
    };
    pb.finish_and_clear();

    if let Err(e) = outcome {
        target.close().await;
        return Err(e);
    }

    if last_err.is_none() {
        if let Err(e) = target
            .cleanup_metas(scope, &ctx.config.app.meta_schema_name)
            .await
        {
            last_err = Some(e);
        }
    }
    target.close().await;

    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn close_and_cleanup(
    ctx: &CommandContext,
    manager: &EngineManager,
    tables: &[DestroyedTableCheckpoint],
    pb: &indicatif::ProgressBar,
    last_err: &mut Option<LodeError>,
) -> Result<()> {
    for table in tables {
        for engine_id in table.engine_ids() {
            if ctx.cancel.is_cancelled() {
                return Err(LodeError::Cancelled);
            }
            ctx.say(format_args!(
                "Closing and cleaning up engine: {} {}",
                table.table_name, engine_id
            ));
            match manager.unsafe_close_engine(&table.table_name, engine_id).await {
                Err(e) => {
                    ctx.say(format_args!("* Encountered error while closing engine: {e}"));
                    *last_err = Some(LodeError::per_engine(
                        format!("{}:{}", table.table_name, engine_id),
                        e,
                    ));
                }
                Ok(closed) => {
                    if let Err(e) = closed.cleanup(&ctx.cancel).await {
                        ctx.say(format_args!("* Encountered error while cleaning up engine: {e}"));
                        *last_err = Some(LodeError::per_engine(closed.tag(), e));
                    }
                }
            }
            pb.inc(1);
        }
    }
    Ok(())
}

fn remove_engine_dirs(
    ctx: &CommandContext,
    dir: &Path,
    tables: &[DestroyedTableCheckpoint],
    pb: &indicatif::ProgressBar,
    last_err: &mut Option<LodeError>,
) {
    for table in tables {
        for engine_id in table.engine_ids() {
            ctx.say(format_args!(
                "Closing and cleaning up engine: {} {}",
                table.table_name, engine_id
            ));
            let (tag, uuid) = make_uuid(&table.table_name, engine_id);
            if let Err(e) = LocalFileBackend::cleanup_engine_dir(dir, uuid) {
                ctx.say(format_args!("* Encountered error while cleanup engine: {e}"));
                *last_err = Some(LodeError::per_engine(tag, e));
            }
            pb.inc(1);
        }
    }
}

fn create_dump_file(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| LodeError::io(format!("failed to create {}", path.display()), e))
}

/// Write `tables.csv`, `engines.csv` and `chunks.csv` under `dir`.
pub async fn checkpoint_dump(ctx: &CommandContext, dir: &Path) -> Result<()> {
    let cpdb = ctx.connector().checkpoints(&ctx.config).await?;
    let result = dump(cpdb.as_ref(), dir).await;
    close_after(cpdb, result).await
}

async fn dump(cpdb: &dyn CheckpointsDb, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| LodeError::io(format!("creating {}", dir.display()), e))?;

    let tables_path = dir.join("tables.csv");
    let mut tables = create_dump_file(&tables_path)?;
    cpdb.dump_tables(&mut tables).await?;
    tables
        .flush()
        .map_err(|e| LodeError::io(format!("writing {}", tables_path.display()), e))?;

    let engines_path = dir.join("engines.csv");
    let mut engines = create_dump_file(&engines_path)?;
    cpdb.dump_engines(&mut engines).await?;
    engines
        .flush()
        .map_err(|e| LodeError::io(format!("writing {}", engines_path.display()), e))?;

    let chunks_path = dir.join("chunks.csv");
    let mut chunks = create_dump_file(&chunks_path)?;
    cpdb.dump_chunks(&mut chunks).await?;
    chunks
        .flush()
        .map_err(|e| LodeError::io(format!("writing {}", chunks_path.display()), e))?;

    info!(dir = %dir.display(), "Dumped checkpoints");
    Ok(())
}

/// Report tables whose only copy of some engine data is local intermediate
/// files.
pub async fn check_local_storage(ctx: &CommandContext) -> Result<()> {
    let backend = ctx.connector().import_backend(&ctx.config)?;
    if !matches!(backend.cleanup_strategy(), CleanupStrategy::RemoveLocalFiles(_)) {
        ctx.say(NO_LOST_FILES);
        return Ok(());
    }
    if !ctx.connector().checkpoints_exist(&ctx.config).await? {
        ctx.say(NO_LOST_FILES);
        return Ok(());
    }

    let cpdb = ctx.connector().checkpoints(&ctx.config).await?;
    let result = cpdb.get_local_storing_tables().await;
    let tables = close_after(cpdb, result).await?;

    if tables.is_empty() {
        ctx.say(NO_LOST_FILES);
    } else {
        let names: Vec<String> = tables.keys().map(|name| name.to_string()).collect();
        ctx.say(format_args!(
            "These tables are missing intermediate files: [{}]",
            names.join(", ")
        ));
    }
    Ok(())
}
