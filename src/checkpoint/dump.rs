//! CSV row layouts for checkpoint dumps. Column order is part of the output
//! format and must stay stable.

use crate::models::{LodeError, Result, TableCheckpoint, TaskCheckpoint};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct TableRow<'a> {
    task_id: i64,
    table_name: String,
    status: String,
    failed: bool,
    alloc_base: i64,
    min_engine_id: Option<i32>,
    max_engine_id: Option<i32>,
    create_time: &'a str,
    update_time: &'a str,
}

#[derive(Debug, Serialize)]
struct EngineRow {
    table_name: String,
    engine_id: i32,
    status: String,
    failed: bool,
    bytes_written: u64,
    rows_written: u64,
    chunk_count: usize,
}

#[derive(Debug, Serialize)]
struct ChunkRow<'a> {
    table_name: String,
    engine_id: i32,
    path: &'a str,
    offset: i64,
    pos: i64,
    end_offset: i64,
    row_id_max: i64,
    kv_bytes: u64,
    kv_count: u64,
    checksum: u64,
}

const TABLE_HEADER: [&str; 9] = [
    "task_id",
    "table_name",
    "status",
    "failed",
    "alloc_base",
    "min_engine_id",
    "max_engine_id",
    "create_time",
    "update_time",
];

const ENGINE_HEADER: [&str; 7] = [
    "table_name",
    "engine_id",
    "status",
    "failed",
    "bytes_written",
    "rows_written",
    "chunk_count",
];

const CHUNK_HEADER: [&str; 10] = [
    "table_name",
    "engine_id",
    "path",
    "offset",
    "pos",
    "end_offset",
    "row_id_max",
    "kv_bytes",
    "kv_count",
    "checksum",
];

fn csv_err(what: &str, e: csv::Error) -> LodeError {
    LodeError::io(format!("writing {what} dump"), e.into())
}

/// Writer that has already emitted `header`, so an empty level still names
/// its columns.
fn header_writer<'w>(
    sink: &'w mut (dyn Write + Send),
    header: &[&str],
    what: &str,
) -> Result<csv::Writer<&'w mut (dyn Write + Send)>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(sink);
    writer.write_record(header).map_err(|e| csv_err(what, e))?;
    Ok(writer)
}

pub(crate) fn write_tables<'a>(
    task: &TaskCheckpoint,
    tables: impl Iterator<Item = &'a TableCheckpoint>,
    sink: &mut (dyn Write + Send),
) -> Result<()> {
    let mut writer = header_writer(sink, &TABLE_HEADER, "tables")?;
    for table in tables {
        let create_time = table.created_at.to_rfc3339();
        let update_time = table.updated_at.to_rfc3339();
        writer
            .serialize(TableRow {
                task_id: task.task_id,
                table_name: table.table_name.to_string(),
                status: table.status.to_string(),
                failed: table.failed,
                alloc_base: table.alloc_base,
                min_engine_id: table.min_engine_id(),
                max_engine_id: table.max_engine_id(),
                create_time: &create_time,
                update_time: &update_time,
            })
            .map_err(|e| csv_err("tables", e))?;
    }
    writer
        .flush()
        .map_err(|e| LodeError::io("flushing tables dump", e))
}

pub(crate) fn write_engines<'a>(
    tables: impl Iterator<Item = &'a TableCheckpoint>,
    sink: &mut (dyn Write + Send),
) -> Result<()> {
    let mut writer = header_writer(sink, &ENGINE_HEADER, "engines")?;
    for table in tables {
        for engine in table.engines.values() {
            writer
                .serialize(EngineRow {
                    table_name: table.table_name.to_string(),
                    engine_id: engine.engine_id,
                    status: engine.status.to_string(),
                    failed: engine.failed,
                    bytes_written: engine.bytes_written,
                    rows_written: engine.rows_written,
                    chunk_count: engine.chunks.len(),
                })
                .map_err(|e| csv_err("engines", e))?;
        }
    }
    writer
        .flush()
        .map_err(|e| LodeError::io("flushing engines dump", e))
}

pub(crate) fn write_chunks<'a>(
    tables: impl Iterator<Item = &'a TableCheckpoint>,
    sink: &mut (dyn Write + Send),
) -> Result<()> {
    let mut writer = header_writer(sink, &CHUNK_HEADER, "chunks")?;
    for table in tables {
        for engine in table.engines.values() {
            for chunk in &engine.chunks {
                writer
                    .serialize(ChunkRow {
                        table_name: table.table_name.to_string(),
                        engine_id: engine.engine_id,
                        path: &chunk.path,
                        offset: chunk.offset,
                        pos: chunk.pos,
                        end_offset: chunk.end_offset,
                        row_id_max: chunk.row_id_max,
                        kv_bytes: chunk.kv_bytes,
                        kv_count: chunk.kv_count,
                        checksum: chunk.checksum,
                    })
                    .map_err(|e| csv_err("chunks", e))?;
            }
        }
    }
    writer
        .flush()
        .map_err(|e| LodeError::io("flushing chunks dump", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineCheckpoint, TableName};

    fn header_line(buf: &[u8]) -> String {
        String::from_utf8_lossy(buf).lines().next().unwrap_or_default().to_string()
    }

    #[test]
    fn test_empty_levels_still_name_their_columns() {
        let task = TaskCheckpoint::default();
        let (mut tables, mut engines, mut chunks) = (Vec::new(), Vec::new(), Vec::new());
        write_tables(&task, std::iter::empty(), &mut tables).unwrap();
        write_engines(std::iter::empty(), &mut engines).unwrap();
        write_chunks(std::iter::empty(), &mut chunks).unwrap();

        assert_eq!(header_line(&tables), TABLE_HEADER.join(","));
        assert_eq!(header_line(&engines), ENGINE_HEADER.join(","));
        assert_eq!(header_line(&chunks), CHUNK_HEADER.join(","));
        assert_ne!(tables, engines);
    }

    #[test]
    fn test_rows_follow_header_order() {
        let mut table = TableCheckpoint::new(TableName::new("db", "t1"));
        table.engines.insert(0, EngineCheckpoint::new(0));
        let mut out = Vec::new();
        write_engines(std::iter::once(&table), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("`db`.`t1`,0,"));
        assert_eq!(lines[1].split(',').count(), ENGINE_HEADER.len());
    }
}
