//! Backend keeping engines as sorted segment files on local disk.
//!
//! Layout of one engine:
//! ```text
//! <sorted_kv_dir>/<engine-uuid>/
//!     meta.json
//!     segment-000000.kv
//!     segment-000001.kv
//! ```
//! A segment is a run of pairs sorted by key, each encoded as
//! `u32 LE key length, key, u32 LE value length, value`.

use super::{CleanupStrategy, ImportBackend, KvPair};
use crate::client::{base_url, build_http_client, check_status, classify};
use crate::models::{Config, LodeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const META_FILE: &str = "meta.json";

/// Summary of one segment file, recorded when the segment is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub file: String,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    pub bytes: u64,
    pub pairs: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineMeta {
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    imported: bool,
    #[serde(default)]
    segments: Vec<SegmentMeta>,
}

/// A contiguous key range ingested in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRange {
    pub start: Vec<u8>,
    /// Inclusive
    pub end: Vec<u8>,
    pub bytes: u64,
    pub segments: Vec<String>,
}

/// Split segments into ranges of roughly `region_split_size` bytes.
///
/// Segments whose key ranges overlap always land in the same range. A range
/// is cut before the next group would push it past the hint, so a single
/// oversized group still forms its own range.
pub fn split_ranges(segments: &[SegmentMeta], region_split_size: u64) -> Vec<ImportRange> {
    let mut sorted: Vec<&SegmentMeta> = segments.iter().filter(|s| s.pairs > 0).collect();
    sorted.sort_by(|a, b| a.first_key.cmp(&b.first_key));

    // merge overlapping segments into groups
    let mut groups: Vec<ImportRange> = Vec::new();
    for segment in sorted {
        match groups.last_mut() {
            Some(group) if segment.first_key <= group.end => {
                if segment.last_key > group.end {
                    group.end = segment.last_key.clone();
                }
                group.bytes += segment.bytes;
                group.segments.push(segment.file.clone());
            }
            _ => groups.push(ImportRange {
                start: segment.first_key.clone(),
                end: segment.last_key.clone(),
                bytes: segment.bytes,
                segments: vec![segment.file.clone()],
            }),
        }
    }

    let mut ranges: Vec<ImportRange> = Vec::new();
    for group in groups {
        match ranges.last_mut() {
            Some(range) if range.bytes + group.bytes <= region_split_size => {
                range.end = group.end;
                range.bytes += group.bytes;
                range.segments.extend(group.segments);
            }
            _ => ranges.push(group),
        }
    }
    ranges
}

fn encode_segment(pairs: &[KvPair]) -> Vec<u8> {
    let mut buf = Vec::new();
    for pair in pairs {
        buf.extend_from_slice(&(pair.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&pair.key);
        buf.extend_from_slice(&(pair.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&pair.value);
    }
    buf
}

/// Split one length-prefixed field off the front of `data`.
fn take_field(data: &mut &[u8]) -> Option<Vec<u8>> {
    if data.len() < 4 {
        return None;
    }
    let (len, rest) = data.split_at(4);
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return None;
    }
    let (field, rest) = rest.split_at(len);
    *data = rest;
    Some(field.to_vec())
}

fn decode_segment(path: &Path, mut data: &[u8]) -> Result<Vec<KvPair>> {
    let corrupt = || LodeError::Parse(format!("corrupt segment {}", path.display()));
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let key = take_field(&mut data).ok_or_else(corrupt)?;
        let value = take_field(&mut data).ok_or_else(corrupt)?;
        pairs.push(KvPair { key, value });
    }
    Ok(pairs)
}

/// Read every pair of a segment file.
pub async fn read_segment(path: &Path) -> Result<Vec<KvPair>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| LodeError::io(format!("reading {}", path.display()), e))?;
    decode_segment(path, &data)
}

/// Delivers one key range of an engine into the storage fleet.
#[async_trait]
pub trait RangeIngester: Send + Sync {
    async fn ingest(&self, engine: Uuid, range: &ImportRange, files: &[PathBuf]) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    engine: Uuid,
    start: &'a [u8],
    end: &'a [u8],
    pairs: Vec<KvPair>,
}

/// Posts ranges to the placement driver's ingest endpoint, which routes
/// them to the stores owning the range.
pub struct HttpRangeIngester {
    client: reqwest::Client,
    url: String,
}

impl HttpRangeIngester {
    pub fn new(config: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.importer.timeout_secs);
        Ok(Self {
            client: build_http_client(&config.security, timeout)?,
            url: format!(
                "{}/import/ingest",
                base_url(&config.security, &config.cluster.pd_addr)
            ),
        })
    }
}

#[async_trait]
impl RangeIngester for HttpRangeIngester {
    async fn ingest(&self, engine: Uuid, range: &ImportRange, files: &[PathBuf]) -> Result<()> {
        let mut pairs = Vec::new();
        for file in files {
            pairs.extend(read_segment(file).await?);
        }
        pairs.sort_by(|a, b| a.key.cmp(&b.key));

        let request = IngestRequest {
            engine,
            start: &range.start,
            end: &range.end,
            pairs,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify("ingest endpoint", e))?;
        check_status(response).await?;
        Ok(())
    }
}

/// Engines as directories under `dir`.
pub struct LocalFileBackend {
    dir: PathBuf,
    ingester: Arc<dyn RangeIngester>,
    meta_lock: Mutex<()>,
}

impl LocalFileBackend {
    pub fn new(dir: impl Into<PathBuf>, ingester: Arc<dyn RangeIngester>) -> Self {
        Self {
            dir: dir.into(),
            ingester,
            meta_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.importer.sorted_kv_dir.clone(),
            Arc::new(HttpRangeIngester::new(config)?),
        ))
    }

    pub fn engine_dir(&self, uuid: Uuid) -> PathBuf {
        self.dir.join(uuid.to_string())
    }

    /// Delete an engine's directory. A missing directory is not an error.
    ///
    /// Needs no backend instance: recovery uses it after the loading process
    /// is gone.
    pub fn cleanup_engine_dir(dir: &Path, uuid: Uuid) -> Result<()> {
        let path = dir.join(uuid.to_string());
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed engine directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LodeError::io(format!("removing {}", path.display()), e)),
        }
    }

    async fn load_meta(&self, uuid: Uuid) -> Result<EngineMeta> {
        let path = self.engine_dir(uuid).join(META_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LodeError::NotFound(format!("engine {uuid}")));
            }
            Err(e) => return Err(LodeError::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| LodeError::Parse(format!("Invalid engine meta {}: {e}", path.display())))
    }

    /// Atomic replace: temp file, then rename.
    async fn save_meta(&self, uuid: Uuid, meta: &EngineMeta) -> Result<()> {
        let dir = self.engine_dir(uuid);
        let path = dir.join(META_FILE);
        let temp = dir.join(format!("{META_FILE}.tmp"));
        let content = serde_json::to_string_pretty(meta)
            .map_err(|e| LodeError::Internal(format!("serializing engine meta: {e}")))?;
        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| LodeError::io(format!("writing {}", temp.display()), e))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| LodeError::io(format!("renaming {}", temp.display()), e))
    }

    /// Segment files present on disk.
    fn discover_segments(&self, uuid: Uuid) -> Result<BTreeSet<String>> {
        let pattern = self.engine_dir(uuid).join("segment-*.kv");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| LodeError::Internal(format!("bad segment pattern: {e}")))?;

        let mut files = BTreeSet::new();
        for entry in paths {
            let path = entry.map_err(|e| LodeError::io("listing segments", e.into_error()))?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.insert(name.to_string());
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ImportBackend for LocalFileBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn cleanup_strategy(&self) -> CleanupStrategy {
        CleanupStrategy::RemoveLocalFiles(self.dir.clone())
    }

    async fn open_engine(&self, uuid: Uuid) -> Result<()> {
        let dir = self.engine_dir(uuid);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| LodeError::io(format!("creating {}", dir.display()), e))?;

        let _guard = self.meta_lock.lock().await;
        match self.load_meta(uuid).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => self.save_meta(uuid, &EngineMeta::default()).await,
            Err(e) => Err(e),
        }
    }

    async fn write_rows(&self, uuid: Uuid, mut pairs: Vec<KvPair>) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        pairs.sort_by(|a, b| a.key.cmp(&b.key));

        let _guard = self.meta_lock.lock().await;
        let mut meta = self.load_meta(uuid).await?;
        if meta.closed {
            return Err(LodeError::InvalidArgument(format!(
                "engine {uuid} is closed for writing"
            )));
        }

        let file = format!("segment-{:06}.kv", meta.segments.len());
        let path = self.engine_dir(uuid).join(&file);
        let data = encode_segment(&pairs);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| LodeError::io(format!("writing {}", path.display()), e))?;

        meta.segments.push(SegmentMeta {
            file,
            first_key: pairs[0].key.clone(),
            last_key: pairs[pairs.len() - 1].key.clone(),
            bytes: data.len() as u64,
            pairs: pairs.len() as u64,
        });
        self.save_meta(uuid, &meta).await
    }

    async fn close_engine(&self, uuid: Uuid) -> Result<()> {
        let _guard = self.meta_lock.lock().await;
        match self.load_meta(uuid).await {
            Ok(mut meta) if !meta.closed => {
                meta.closed = true;
                self.save_meta(uuid, &meta).await
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn import_engine(
        &self,
        cancel: &CancellationToken,
        uuid: Uuid,
        region_split_size: u64,
    ) -> Result<()> {
        let _guard = self.meta_lock.lock().await;
        let mut meta = self.load_meta(uuid).await?;
        if meta.imported {
            debug!(%uuid, "Engine already imported");
            return Ok(());
        }

        let on_disk = self.discover_segments(uuid)?;
        for segment in &meta.segments {
            if !on_disk.contains(&segment.file) {
                return Err(LodeError::NotFound(format!(
                    "segment {} of engine {uuid}",
                    segment.file
                )));
            }
        }
        let orphans = on_disk.len().saturating_sub(meta.segments.len());
        if orphans > 0 {
            warn!(%uuid, orphans, "Ignoring segment files not recorded in engine meta");
        }

        let ranges = split_ranges(&meta.segments, region_split_size);
        info!(%uuid, ranges = ranges.len(), "Ingesting engine");
        let dir = self.engine_dir(uuid);
        for range in &ranges {
            if cancel.is_cancelled() {
                return Err(LodeError::Cancelled);
            }
            let files: Vec<PathBuf> = range.segments.iter().map(|f| dir.join(f)).collect();
            tokio::select! {
                _ = cancel.cancelled() => return Err(LodeError::Cancelled),
                result = self.ingester.ingest(uuid, range, &files) => result?,
            }
        }

        meta.closed = true;
        meta.imported = true;
        self.save_meta(uuid, &meta).await
    }

    async fn cleanup_engine(&self, uuid: Uuid) -> Result<()> {
        Self::cleanup_engine_dir(&self.dir, uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Records every ingested range with the pairs it carried.
    #[derive(Default)]
    struct RecordingIngester {
        ranges: StdMutex<Vec<(ImportRange, usize)>>,
    }

    #[async_trait]
    impl RangeIngester for RecordingIngester {
        async fn ingest(&self, _engine: Uuid, range: &ImportRange, files: &[PathBuf]) -> Result<()> {
            let mut count = 0;
            for file in files {
                count += read_segment(file).await?.len();
            }
            self.ranges.lock().unwrap().push((range.clone(), count));
            Ok(())
        }
    }

    fn segment(file: &str, first: &str, last: &str, bytes: u64) -> SegmentMeta {
        SegmentMeta {
            file: file.into(),
            first_key: first.as_bytes().to_vec(),
            last_key: last.as_bytes().to_vec(),
            bytes,
            pairs: 1,
        }
    }

    #[test]
    fn test_split_ranges_respects_hint() {
        let segments = vec![
            segment("s2", "c", "d", 40),
            segment("s0", "a", "b", 40),
            segment("s1", "e", "f", 40),
            segment("s3", "g", "h", 40),
        ];
        let ranges = split_ranges(&segments, 100);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, b"a");
        assert_eq!(ranges[0].end, b"d");
        assert_eq!(ranges[0].segments, vec!["s0", "s2"]);
        assert_eq!(ranges[1].bytes, 80);
    }

    #[test]
    fn test_split_ranges_keeps_overlaps_together() {
        let segments = vec![
            segment("s0", "a", "m", 80),
            segment("s1", "c", "z", 80),
            segment("s2", "zz", "zzz", 10),
        ];
        let ranges = split_ranges(&segments, 100);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].segments, vec!["s0", "s1"]);
        assert_eq!(ranges[0].end, b"z");
        assert_eq!(ranges[1].segments, vec!["s2"]);
    }

    #[test]
    fn test_segment_decode_rejects_truncation() {
        let data = encode_segment(&[KvPair::new("key", "value")]);
        let path = Path::new("segment-000000.kv");
        assert_eq!(decode_segment(path, &data).unwrap().len(), 1);
        assert!(decode_segment(path, &data[..data.len() - 1]).is_err());
    }

    #[test]
    fn test_cleanup_missing_dir_succeeds() {
        let temp = TempDir::new().unwrap();
        LocalFileBackend::cleanup_engine_dir(temp.path(), Uuid::new_v4()).unwrap();
    }

    #[tokio::test]
    async fn test_write_import_cleanup() {
        let temp = TempDir::new().unwrap();
        let ingester = Arc::new(RecordingIngester::default());
        let backend = LocalFileBackend::new(temp.path(), ingester.clone());
        let uuid = Uuid::new_v4();
        let cancel = CancellationToken::new();

        backend.open_engine(uuid).await.unwrap();
        backend
            .write_rows(uuid, vec![KvPair::new("b", "2"), KvPair::new("a", "1")])
            .await
            .unwrap();
        backend
            .write_rows(uuid, vec![KvPair::new("c", "3")])
            .await
            .unwrap();
        backend.close_engine(uuid).await.unwrap();
        assert!(backend.write_rows(uuid, vec![KvPair::new("d", "4")]).await.is_err());

        backend.import_engine(&cancel, uuid, 1 << 20).await.unwrap();
        {
            let ranges = ingester.ranges.lock().unwrap();
            assert_eq!(ranges.len(), 1);
            assert_eq!(ranges[0].1, 3);
            assert_eq!(ranges[0].0.start, b"a");
            assert_eq!(ranges[0].0.end, b"c");
        }

        // second import is a no-op
        backend.import_engine(&cancel, uuid, 1 << 20).await.unwrap();
        assert_eq!(ingester.ranges.lock().unwrap().len(), 1);

        backend.cleanup_engine(uuid).await.unwrap();
        assert!(!backend.engine_dir(uuid).exists());
        backend.cleanup_engine(uuid).await.unwrap();
    }

    #[tokio::test]
    async fn test_import_missing_engine_is_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = LocalFileBackend::new(temp.path(), Arc::new(RecordingIngester::default()));
        let err = backend
            .import_engine(&CancellationToken::new(), Uuid::new_v4(), 1024)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_import_detects_missing_segment() {
        let temp = TempDir::new().unwrap();
        let backend = LocalFileBackend::new(temp.path(), Arc::new(RecordingIngester::default()));
        let uuid = Uuid::new_v4();
        backend.open_engine(uuid).await.unwrap();
        backend
            .write_rows(uuid, vec![KvPair::new("a", "1")])
            .await
            .unwrap();
        std::fs::remove_file(backend.engine_dir(uuid).join("segment-000000.kv")).unwrap();

        let err = backend
            .import_engine(&CancellationToken::new(), uuid, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, LodeError::NotFound(_)));
    }

    #[test]
    fn test_strategy_points_at_sorted_kv_dir() {
        let backend = LocalFileBackend::new("/data/sorted", Arc::new(RecordingIngester::default()));
        assert_eq!(
            backend.cleanup_strategy(),
            CleanupStrategy::RemoveLocalFiles(PathBuf::from("/data/sorted"))
        );
    }
}
