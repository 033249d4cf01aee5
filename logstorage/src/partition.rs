//! Minimal per-day partition engine
//!
//! A partition is a directory holding immutable *part* files with the
//! ingested rows plus a small stream index. Rows are buffered in memory
//! and flushed to a new part under `small/` when the flush interval
//! elapses on the ingest path (or on an explicit flush); `force_merge`
//! folds every part into a single part under `big/`. Buffered rows that
//! were never flushed do not survive a crash.
//!
//! Deletion is crash-safe: a `.deleting` marker is fsynced into the
//! directory before it is removed, so an interrupted deletion is
//! recognized on the next startup and finished there.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::log_batch::{LogBatch, StreamId};
use crate::time_util::TimestampDisplay;

const PART_MAGIC: &[u8; 8] = b"SLPART01";
const PART_VERSION: u32 = 1;
const PART_HEADER_LEN: usize = 20;
const STREAMS_MAGIC: &[u8; 8] = b"SLSIDX01";

const SMALL_PARTS_DIRNAME: &str = "small";
const BIG_PARTS_DIRNAME: &str = "big";
const STREAMS_INDEX_FILENAME: &str = "streams.idx";
const DELETING_MARKER_FILENAME: &str = ".deleting";
const PART_EXTENSION: &str = "part";

/// Rows buffered in memory before a flush is forced regardless of the
/// flush interval.
const MAX_BUFFERED_ROWS: usize = 8 * 1024;

/// Aggregated statistics for one or more partitions.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PartitionStats {
    pub rows_count: u64,
    pub index_size_bytes: u64,
    pub small_parts_size_bytes: u64,
    pub big_parts_size_bytes: u64,
    pub small_parts_count: u64,
    pub big_parts_count: u64,
}

struct BufferedRow {
    timestamp: i64,
    stream_id: StreamId,
    stream_tags: Bytes,
    fields: Bytes,
}

struct RowBuffer {
    rows: Vec<BufferedRow>,
    /// Streams registered in this partition, loaded from the index at open.
    streams: HashSet<StreamId>,
    /// Streams seen since the last flush, not yet appended to the index.
    pending_streams: Vec<StreamId>,
    last_flush: Instant,
}

/// One calendar day worth of log rows on disk.
pub struct Partition {
    path: PathBuf,
    name: String,
    flush_interval: Duration,
    log_ingested_rows: bool,

    buffer: Mutex<RowBuffer>,

    rows_count: AtomicU64,
    index_size_bytes: AtomicU64,
    small_parts_size_bytes: AtomicU64,
    big_parts_size_bytes: AtomicU64,
    small_parts_count: AtomicU64,
    big_parts_count: AtomicU64,
    next_part_seq: AtomicU64,
    closed: AtomicBool,
}

/// Creates an empty partition directory at `path`.
pub(crate) fn create_partition(path: &Path) -> Result<()> {
    fs::create_dir(path).with_context(|| format!("cannot create partition dir {}", path.display()))?;
    fs::create_dir(path.join(SMALL_PARTS_DIRNAME))?;
    fs::create_dir(path.join(BIG_PARTS_DIRNAME))?;
    let mut index = File::create(path.join(STREAMS_INDEX_FILENAME))?;
    index.write_all(STREAMS_MAGIC)?;
    index.sync_all()?;
    crate::fs_util::fsync_dir(path)?;
    if let Some(parent) = path.parent() {
        crate::fs_util::fsync_dir(parent)?;
    }
    Ok(())
}

/// Opens an existing partition directory.
pub(crate) fn open_partition(
    path: &Path,
    flush_interval: Duration,
    log_ingested_rows: bool,
) -> Result<Partition> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("partition path {} has no utf-8 name", path.display()))?
        .to_string();

    let (streams, index_size_bytes) = read_streams_index(&path.join(STREAMS_INDEX_FILENAME))?;

    let mut rows_count = 0u64;
    let mut max_seq = 0u64;
    let small = scan_parts_dir(&path.join(SMALL_PARTS_DIRNAME), &mut rows_count, &mut max_seq)?;
    let big = scan_parts_dir(&path.join(BIG_PARTS_DIRNAME), &mut rows_count, &mut max_seq)?;

    Ok(Partition {
        path: path.to_path_buf(),
        name,
        flush_interval,
        log_ingested_rows,
        buffer: Mutex::new(RowBuffer {
            rows: Vec::new(),
            streams,
            pending_streams: Vec::new(),
            last_flush: Instant::now(),
        }),
        rows_count: AtomicU64::new(rows_count),
        index_size_bytes: AtomicU64::new(index_size_bytes),
        small_parts_size_bytes: AtomicU64::new(small.size_bytes),
        big_parts_size_bytes: AtomicU64::new(big.size_bytes),
        small_parts_count: AtomicU64::new(small.count),
        big_parts_count: AtomicU64::new(big.count),
        next_part_seq: AtomicU64::new(max_seq + 1),
        closed: AtomicBool::new(false),
    })
}

/// Deletes a partition directory, surviving interruption half-way.
///
/// The caller must guarantee the partition is closed.
pub(crate) fn delete_partition(path: &Path) -> Result<()> {
    let marker = path.join(DELETING_MARKER_FILENAME);
    let file = File::create(&marker)
        .with_context(|| format!("cannot mark partition {} for deletion", path.display()))?;
    file.sync_all()?;
    crate::fs_util::fsync_dir(path)?;
    fs::remove_dir_all(path)
        .with_context(|| format!("cannot remove partition dir {}", path.display()))?;
    if let Some(parent) = path.parent() {
        crate::fs_util::fsync_dir(parent)?;
    }
    Ok(())
}

/// Returns true if a deletion of this partition was interrupted.
pub(crate) fn is_partially_removed(path: &Path) -> bool {
    path.join(DELETING_MARKER_FILENAME).exists()
}

struct PartsDirSummary {
    count: u64,
    size_bytes: u64,
}

fn scan_parts_dir(dir: &Path, rows_count: &mut u64, max_seq: &mut u64) -> Result<PartsDirSummary> {
    let mut summary = PartsDirSummary { count: 0, size_bytes: 0 };
    let entries =
        fs::read_dir(dir).with_context(|| format!("cannot read parts dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let part_path = entry.path();
        if part_path.extension().and_then(|e| e.to_str()) != Some(PART_EXTENSION) {
            bail!("unexpected entry {} in parts dir", part_path.display());
        }
        let seq: u64 = part_path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .with_context(|| format!("part {} has a malformed name", part_path.display()))?;
        *max_seq = (*max_seq).max(seq);
        *rows_count += read_part_header(&part_path)?;
        summary.count += 1;
        summary.size_bytes += entry.metadata()?.len();
    }
    Ok(summary)
}

fn read_part_header(path: &Path) -> Result<u64> {
    let mut file =
        File::open(path).with_context(|| format!("cannot open part {}", path.display()))?;
    let mut header = [0u8; PART_HEADER_LEN];
    file.read_exact(&mut header)
        .with_context(|| format!("cannot read header of part {}", path.display()))?;
    if &header[..8] != PART_MAGIC {
        bail!("part {} has a bad magic", path.display());
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if version != PART_VERSION {
        bail!("part {} has unsupported version {version}", path.display());
    }
    Ok(u64::from_le_bytes(header[12..20].try_into().unwrap()))
}

fn read_streams_index(path: &Path) -> Result<(HashSet<StreamId>, u64)> {
    let file =
        File::open(path).with_context(|| format!("cannot open stream index {}", path.display()))?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .with_context(|| format!("stream index {} is truncated", path.display()))?;
    if &magic != STREAMS_MAGIC {
        bail!("stream index {} has a bad magic", path.display());
    }
    let mut streams = HashSet::new();
    let mut id = [0u8; 16];
    loop {
        match reader.read_exact(&mut id) {
            Ok(()) => {
                streams.insert(StreamId::from_bytes(id));
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot read stream index {}", path.display()));
            }
        }
    }
    Ok((streams, size))
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends all rows of `batch` to the partition.
    ///
    /// Rows become durable at the next flush; ordering within the batch
    /// is preserved.
    pub(crate) fn add_rows(&self, batch: &LogBatch) -> Result<()> {
        debug_assert!(!self.closed.load(Ordering::Acquire));
        let mut buffer = self.buffer.lock().unwrap();
        for idx in 0..batch.len() {
            let entry = batch.get(idx);
            if buffer.streams.insert(entry.stream_id) {
                buffer.pending_streams.push(entry.stream_id);
            }
            if self.log_ingested_rows {
                debug!(
                    "ingested row into partition {}: timestamp={} stream={}",
                    self.name,
                    TimestampDisplay(entry.timestamp),
                    entry.stream_id,
                );
            }
            buffer.rows.push(BufferedRow {
                timestamp: entry.timestamp,
                stream_id: entry.stream_id,
                stream_tags: entry.stream_tags.clone(),
                fields: entry.fields.clone(),
            });
        }
        self.rows_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        if buffer.rows.len() >= MAX_BUFFERED_ROWS
            || buffer.last_flush.elapsed() >= self.flush_interval
        {
            self.flush_locked(&mut buffer)?;
        }
        Ok(())
    }

    /// Flushes buffered rows so they become visible to search.
    ///
    /// Slow; meant for tests and debugging.
    pub(crate) fn debug_flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap();
        self.flush_locked(&mut buffer)
    }

    /// Merges all parts into a single big part.
    pub(crate) fn force_merge(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap();
        self.flush_locked(&mut buffer)?;

        let small_dir = self.path.join(SMALL_PARTS_DIRNAME);
        let big_dir = self.path.join(BIG_PARTS_DIRNAME);
        let mut sources = list_parts(&small_dir)?;
        let big_sources = list_parts(&big_dir)?;
        if sources.is_empty() && big_sources.len() <= 1 {
            // already fully merged
            return Ok(());
        }
        sources.extend(big_sources);

        let mut total_rows = 0u64;
        for source in &sources {
            total_rows += read_part_header(source)?;
        }

        let seq = self.next_part_seq.fetch_add(1, Ordering::Relaxed);
        let merged_path = big_dir.join(format!("{seq:010}.{PART_EXTENSION}"));
        let merged = File::create(&merged_path)
            .with_context(|| format!("cannot create merged part {}", merged_path.display()))?;
        let mut writer = BufWriter::new(merged);
        write_part_header(&mut writer, total_rows)?;
        for source in &sources {
            let mut reader =
                File::open(source).with_context(|| format!("cannot open {}", source.display()))?;
            reader.seek(SeekFrom::Start(PART_HEADER_LEN as u64))?;
            std::io::copy(&mut reader, &mut writer)
                .with_context(|| format!("cannot merge part {}", source.display()))?;
        }
        let merged = writer
            .into_inner()
            .context("cannot flush merged part")?;
        merged.sync_all()?;
        crate::fs_util::fsync_dir(&big_dir)?;

        for source in &sources {
            fs::remove_file(source)
                .with_context(|| format!("cannot remove merged source {}", source.display()))?;
        }
        crate::fs_util::fsync_dir(&small_dir)?;
        crate::fs_util::fsync_dir(&big_dir)?;

        let merged_size = fs::metadata(&merged_path)?.len();
        self.small_parts_size_bytes.store(0, Ordering::Relaxed);
        self.small_parts_count.store(0, Ordering::Relaxed);
        self.big_parts_size_bytes.store(merged_size, Ordering::Relaxed);
        self.big_parts_count.store(1, Ordering::Relaxed);
        Ok(())
    }

    /// Accumulates this partition's stats into `stats`.
    pub(crate) fn update_stats(&self, stats: &mut PartitionStats) {
        stats.rows_count += self.rows_count.load(Ordering::Relaxed);
        stats.index_size_bytes += self.index_size_bytes.load(Ordering::Relaxed);
        stats.small_parts_size_bytes += self.small_parts_size_bytes.load(Ordering::Relaxed);
        stats.big_parts_size_bytes += self.big_parts_size_bytes.load(Ordering::Relaxed);
        stats.small_parts_count += self.small_parts_count.load(Ordering::Relaxed);
        stats.big_parts_count += self.big_parts_count.load(Ordering::Relaxed);
    }

    /// Returns the total on-disk footprint used for disk-usage retention.
    pub(crate) fn disk_usage_bytes(&self) -> u64 {
        self.index_size_bytes.load(Ordering::Relaxed)
            + self.small_parts_size_bytes.load(Ordering::Relaxed)
            + self.big_parts_size_bytes.load(Ordering::Relaxed)
    }

    /// Flushes pending state and closes the partition. One-shot.
    pub(crate) fn close(&self) -> Result<()> {
        assert!(
            !self.closed.swap(true, Ordering::AcqRel),
            "BUG: partition {} closed twice",
            self.name
        );
        let mut buffer = self.buffer.lock().unwrap();
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut RowBuffer) -> Result<()> {
        if buffer.rows.is_empty() && buffer.pending_streams.is_empty() {
            buffer.last_flush = Instant::now();
            return Ok(());
        }

        if !buffer.rows.is_empty() {
            let seq = self.next_part_seq.fetch_add(1, Ordering::Relaxed);
            let small_dir = self.path.join(SMALL_PARTS_DIRNAME);
            let part_path = small_dir.join(format!("{seq:010}.{PART_EXTENSION}"));
            let file = File::create(&part_path)
                .with_context(|| format!("cannot create part {}", part_path.display()))?;
            let mut writer = BufWriter::new(file);
            write_part_header(&mut writer, buffer.rows.len() as u64)?;
            for row in &buffer.rows {
                writer.write_all(&row.timestamp.to_le_bytes())?;
                writer.write_all(&row.stream_id.to_bytes())?;
                writer.write_all(&(row.stream_tags.len() as u32).to_le_bytes())?;
                writer.write_all(&row.stream_tags)?;
                writer.write_all(&(row.fields.len() as u32).to_le_bytes())?;
                writer.write_all(&row.fields)?;
            }
            let file = writer
                .into_inner()
                .with_context(|| format!("cannot flush part {}", part_path.display()))?;
            file.sync_all()?;
            crate::fs_util::fsync_dir(&small_dir)?;
            let size = fs::metadata(&part_path)?.len();
            self.small_parts_size_bytes.fetch_add(size, Ordering::Relaxed);
            self.small_parts_count.fetch_add(1, Ordering::Relaxed);
            buffer.rows.clear();
        }

        if !buffer.pending_streams.is_empty() {
            let index_path = self.path.join(STREAMS_INDEX_FILENAME);
            let mut index = OpenOptions::new()
                .append(true)
                .open(&index_path)
                .with_context(|| format!("cannot open stream index {}", index_path.display()))?;
            for stream_id in &buffer.pending_streams {
                index.write_all(&stream_id.to_bytes())?;
            }
            index.sync_all()?;
            self.index_size_bytes
                .store(index.metadata()?.len(), Ordering::Relaxed);
            buffer.pending_streams.clear();
        }

        buffer.last_flush = Instant::now();
        Ok(())
    }
}

fn write_part_header<W: Write>(writer: &mut W, rows: u64) -> Result<()> {
    writer.write_all(PART_MAGIC)?;
    writer.write_all(&PART_VERSION.to_le_bytes())?;
    writer.write_all(&rows.to_le_bytes())?;
    Ok(())
}

fn list_parts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut parts = vec![];
    for entry in fs::read_dir(dir)? {
        parts.push(entry?.path());
    }
    parts.sort();
    Ok(parts)
}
