//! Checkpoint records: task, table, engine and chunk progress.
//!
//! Ownership mirrors the ledger hierarchy: a table owns its engines, an
//! engine owns its chunks. A record can therefore never belong to two parents.

use crate::models::{LodeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Engine id of a table's index engine.
pub const INDEX_ENGINE_ID: i32 = -1;

/// Progress of a table or engine. Ordered: later stages compare greater.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Missing,
    Loaded,
    AllWritten,
    Closed,
    Imported,
    AlteredSchema,
    Analyzed,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::Loaded => "loaded",
            Self::AllWritten => "all_written",
            Self::Closed => "closed",
            Self::Imported => "imported",
            Self::AlteredSchema => "altered_schema",
            Self::Analyzed => "analyzed",
        };
        f.write_str(s)
    }
}

/// Fully qualified table name, stored as `` `schema`.`table` ``.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

fn quote_ident(f: &mut fmt::Formatter<'_>, ident: &str) -> fmt::Result {
    write!(f, "`{}`", ident.replace('`', "``"))
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        quote_ident(f, &self.schema)?;
        f.write_str(".")?;
        quote_ident(f, &self.table)
    }
}

/// Split one identifier off the front of `s`, quoted or bare.
fn take_ident(s: &str) -> Option<(String, &str)> {
    if let Some(rest) = s.strip_prefix('`') {
        let mut ident = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '`' {
                if matches!(chars.peek(), Some((_, '`'))) {
                    ident.push('`');
                    chars.next();
                } else {
                    return Some((ident, &rest[i + 1..]));
                }
            } else {
                ident.push(c);
            }
        }
        None
    } else {
        let end = s.find('.').unwrap_or(s.len());
        Some((s[..end].to_string(), &s[end..]))
    }
}

impl FromStr for TableName {
    type Err = LodeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            LodeError::InvalidArgument(format!(
                "table name must look like `db`.`table` or db.table, got {s:?}"
            ))
        };
        let (schema, rest) = take_ident(s.trim()).ok_or_else(invalid)?;
        let rest = rest.strip_prefix('.').ok_or_else(invalid)?;
        let (table, rest) = take_ident(rest).ok_or_else(invalid)?;
        if schema.is_empty() || table.is_empty() || !rest.is_empty() {
            return Err(invalid());
        }
        Ok(Self { schema, table })
    }
}

impl TryFrom<String> for TableName {
    type Error = LodeError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TableName> for String {
    fn from(name: TableName) -> Self {
        name.to_string()
    }
}

/// Which tables a checkpoint command applies to.
///
/// Qualified names always contain a `.`, so the literal `all` on the command
/// line can never collide with a real table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableScope {
    All,
    Table(TableName),
}

impl TableScope {
    pub fn matches(&self, name: &TableName) -> bool {
        match self {
            Self::All => true,
            Self::Table(t) => t == name,
        }
    }
}

impl FromStr for TableScope {
    type Err = LodeError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim() == "all" {
            Ok(Self::All)
        } else {
            Ok(Self::Table(s.parse()?))
        }
    }
}

impl fmt::Display for TableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Table(t) => t.fmt(f),
        }
    }
}

/// One bulk-load run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    /// Zero until the task is initialized
    pub task_id: i64,
    #[serde(default)]
    pub source_dir: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub importer_addr: String,
    #[serde(default)]
    pub pd_addr: String,
    #[serde(default)]
    pub sorted_kv_dir: String,
    #[serde(default)]
    pub tool_version: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskCheckpoint {
    pub fn is_initialized(&self) -> bool {
        self.task_id != 0
    }
}

/// Progress of one source-data chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    /// Source file path
    pub path: String,
    /// Start offset of the chunk in the file
    pub offset: i64,
    /// Consumed up to this offset
    pub pos: i64,
    /// End offset of the chunk
    pub end_offset: i64,
    #[serde(default)]
    pub row_id_max: i64,
    #[serde(default)]
    pub kv_bytes: u64,
    #[serde(default)]
    pub kv_count: u64,
    #[serde(default)]
    pub checksum: u64,
}

impl ChunkCheckpoint {
    /// Whether any data from this chunk already reached the engine.
    pub fn has_progress(&self) -> bool {
        self.pos > self.offset
    }
}

/// Progress of one import engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    pub engine_id: i32,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(default)]
    pub chunks: Vec<ChunkCheckpoint>,
}

impl EngineCheckpoint {
    pub fn new(engine_id: i32) -> Self {
        Self {
            engine_id,
            status: CheckpointStatus::Loaded,
            ..Default::default()
        }
    }
}

/// Progress of one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub table_name: TableName,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub alloc_base: i64,
    #[serde(default)]
    pub engines: BTreeMap<i32, EngineCheckpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableCheckpoint {
    pub fn new(table_name: TableName) -> Self {
        let now = Utc::now();
        Self {
            table_name,
            status: CheckpointStatus::Loaded,
            failed: false,
            alloc_base: 0,
            engines: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn min_engine_id(&self) -> Option<i32> {
        self.engines.keys().next().copied()
    }

    pub fn max_engine_id(&self) -> Option<i32> {
        self.engines.keys().next_back().copied()
    }
}

/// Snapshot of a table removed by destroy-error, enough to find its engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyedTableCheckpoint {
    pub table_name: TableName,
    pub min_engine_id: i32,
    pub max_engine_id: i32,
}

impl DestroyedTableCheckpoint {
    /// Engine ids to clean, empty when the table never allocated one.
    pub fn engine_ids(&self) -> std::ops::RangeInclusive<i32> {
        self.min_engine_id..=self.max_engine_id
    }
}

/// Progress delta reported by the ingestion path for one table.
#[derive(Debug, Clone, Default)]
pub struct CheckpointDiff {
    pub table_status: Option<CheckpointStatus>,
    pub table_failed: bool,
    pub alloc_base: Option<i64>,
    pub engines: BTreeMap<i32, EngineDiff>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineDiff {
    pub status: Option<CheckpointStatus>,
    pub failed: bool,
    pub bytes_written: u64,
    pub rows_written: u64,
    /// Chunk progress keyed by (path, offset)
    pub chunks: Vec<ChunkCheckpoint>,
}

impl CheckpointDiff {
    pub fn table_status(status: CheckpointStatus) -> Self {
        Self {
            table_status: Some(status),
            ..Default::default()
        }
    }

    pub fn table_failed() -> Self {
        Self {
            table_failed: true,
            ..Default::default()
        }
    }

    pub fn engine(mut self, engine_id: i32, diff: EngineDiff) -> Self {
        self.engines.insert(engine_id, diff);
        self
    }

    /// Merge into a table checkpoint. Status never moves backwards here.
    pub fn apply_to(&self, table: &mut TableCheckpoint) {
        if let Some(status) = self.table_status {
            table.status = table.status.max(status);
        }
        table.failed |= self.table_failed;
        if let Some(base) = self.alloc_base {
            table.alloc_base = table.alloc_base.max(base);
        }
        for (engine_id, diff) in &self.engines {
            let engine = table
                .engines
                .entry(*engine_id)
                .or_insert_with(|| EngineCheckpoint::new(*engine_id));
            if let Some(status) = diff.status {
                engine.status = engine.status.max(status);
            }
            engine.failed |= diff.failed;
            engine.bytes_written += diff.bytes_written;
            engine.rows_written += diff.rows_written;
            for chunk in &diff.chunks {
                match engine
                    .chunks
                    .iter_mut()
                    .find(|c| c.path == chunk.path && c.offset == chunk.offset)
                {
                    Some(existing) => {
                        existing.pos = existing.pos.max(chunk.pos);
                        existing.row_id_max = existing.row_id_max.max(chunk.row_id_max);
                        existing.end_offset = chunk.end_offset;
                        existing.kv_bytes = chunk.kv_bytes;
                        existing.kv_count = chunk.kv_count;
                        existing.checksum = chunk.checksum;
                    }
                    None => engine.chunks.push(chunk.clone()),
                }
            }
        }
        table.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_parse_forms() {
        let bare: TableName = "db.t1".parse().unwrap();
        let quoted: TableName = "`db`.`t1`".parse().unwrap();
        assert_eq!(bare, quoted);
        assert_eq!(bare.to_string(), "`db`.`t1`");

        let odd: TableName = "`we``ird`.`a.b`".parse().unwrap();
        assert_eq!(odd.schema(), "we`ird");
        assert_eq!(odd.table(), "a.b");
        assert_eq!(odd.to_string().parse::<TableName>().unwrap(), odd);
    }

    #[test]
    fn test_table_name_rejects_garbage() {
        assert!("t1".parse::<TableName>().is_err());
        assert!("db.".parse::<TableName>().is_err());
        assert!("`db`.`t1`x".parse::<TableName>().is_err());
        assert!("`db.t1".parse::<TableName>().is_err());
    }

    #[test]
    fn test_scope_all_is_not_a_table() {
        assert_eq!("all".parse::<TableScope>().unwrap(), TableScope::All);
        let scope: TableScope = "`all`.`all`".parse().unwrap();
        assert!(matches!(scope, TableScope::Table(_)));
    }

    #[test]
    fn test_status_is_ordered() {
        assert!(CheckpointStatus::Loaded < CheckpointStatus::Closed);
        assert!(CheckpointStatus::Imported < CheckpointStatus::Analyzed);
    }

    #[test]
    fn test_diff_never_regresses_status() {
        let mut table = TableCheckpoint::new("db.t".parse().unwrap());
        CheckpointDiff::table_status(CheckpointStatus::Imported).apply_to(&mut table);
        CheckpointDiff::table_status(CheckpointStatus::Closed).apply_to(&mut table);
        assert_eq!(table.status, CheckpointStatus::Imported);
    }

    #[test]
    fn test_diff_merges_chunk_progress() {
        let mut table = TableCheckpoint::new("db.t".parse().unwrap());
        let chunk = |pos| ChunkCheckpoint {
            path: "a.csv".into(),
            offset: 0,
            pos,
            end_offset: 100,
            ..Default::default()
        };
        let diff = |pos| {
            CheckpointDiff::default().engine(
                0,
                EngineDiff {
                    chunks: vec![chunk(pos)],
                    rows_written: 1,
                    ..Default::default()
                },
            )
        };
        diff(40).apply_to(&mut table);
        diff(70).apply_to(&mut table);
        diff(10).apply_to(&mut table);

        let engine = &table.engines[&0];
        assert_eq!(engine.chunks.len(), 1);
        assert_eq!(engine.chunks[0].pos, 70);
        assert_eq!(engine.rows_written, 3);
    }

    #[test]
    fn test_engine_range_from_map() {
        let mut table = TableCheckpoint::new("db.t".parse().unwrap());
        assert_eq!(table.min_engine_id(), None);
        for id in [INDEX_ENGINE_ID, 0, 1, 2] {
            table.engines.insert(id, EngineCheckpoint::new(id));
        }
        assert_eq!(table.min_engine_id(), Some(-1));
        assert_eq!(table.max_engine_id(), Some(2));
    }
}
