//! The storage: partition lifecycle, ingest routing and retention
//!
//! Owns the on-disk layout under the storage directory: an exclusive
//! lock file plus one partition directory per UTC day under
//! `partitions/`. Incoming batches are routed to the partition covering
//! each entry's day; two background watchers evict partitions by age
//! and by disk budget.

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cache::StreamIdCache;
use crate::error::StorageError;
use crate::fs_util;
use crate::log_batch::LogBatch;
use crate::partition::{self, PartitionStats};
use crate::partition_set::{PartitionHandle, PartitionSet};
use crate::retention;
use crate::throttle;
use crate::time_util::{
    TimestampDisplay, day_from_nsecs, day_min_timestamp, parse_partition_name, partition_name,
};

const PARTITIONS_DIRNAME: &str = "partitions";
const FLOCK_FILENAME: &str = "flock.lock";

/// Configuration for [`Storage::open`].
///
/// Out-of-range values are clamped rather than rejected; see the field
/// docs for the floors.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum age of retained data. Entries older than this are dropped
    /// at ingestion; partitions fully older than this are deleted.
    /// Clamped to at least 24h.
    pub retention: Duration,

    /// Optional cap on the total partition footprint. When non-zero, the
    /// oldest partitions are dropped until the total fits, always
    /// keeping the two newest.
    pub max_disk_space_usage_bytes: u64,

    /// Cadence at which partitions move buffered rows to disk. Clamped
    /// to at least 1s.
    pub flush_interval: Duration,

    /// How far into the future entry timestamps may point. Entries
    /// further out are dropped; partitions further out are deleted at
    /// startup. Clamped to at least 24h.
    pub future_retention: Duration,

    /// Free-space threshold under which [`Storage::is_read_only`]
    /// reports true.
    pub min_free_disk_space_bytes: u64,

    /// Log the first sighting of every log stream. Useful when chasing
    /// high-cardinality issues.
    pub log_new_streams: bool,

    /// Log every ingested row. Useful when debugging ingestion.
    pub log_ingested_rows: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            max_disk_space_usage_bytes: 0,
            flush_interval: Duration::from_secs(1),
            future_retention: Duration::from_secs(2 * 24 * 3600),
            min_free_disk_space_bytes: 10_000_000,
            log_new_streams: false,
            log_ingested_rows: false,
        }
    }
}

/// Counters surfaced by [`Storage::update_stats`].
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Rows dropped at ingestion because their timestamp was older than
    /// the retention window allows.
    pub rows_dropped_too_small_timestamp: u64,

    /// Rows dropped at ingestion because their timestamp was too far in
    /// the future.
    pub rows_dropped_too_big_timestamp: u64,

    pub partitions_count: u64,

    pub is_read_only: bool,

    /// Aggregated over all live partitions.
    pub partition_stats: PartitionStats,
}

impl StorageStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// State shared between the storage facade and its background watchers.
pub(crate) struct StorageCore {
    path: PathBuf,
    partitions_path: PathBuf,

    pub(crate) retention: Duration,
    pub(crate) max_disk_space_usage_bytes: u64,
    flush_interval: Duration,
    future_retention: Duration,
    min_free_disk_space_bytes: u64,
    log_new_streams: bool,
    log_ingested_rows: bool,

    /// Held for the storage's lifetime; dropping it releases the flock.
    flock_file: Mutex<Option<File>>,

    pub(crate) partition_set: PartitionSet,

    stream_id_cache: StreamIdCache,

    rows_dropped_too_small_ts: AtomicU64,
    rows_dropped_too_big_ts: AtomicU64,
}

impl StorageCore {
    /// Smallest day ingestion currently accepts.
    pub(crate) fn min_allowed_day(&self) -> i64 {
        day_from_nsecs(now_nsecs() - self.retention.as_nanos() as i64)
    }

    /// Biggest day ingestion currently accepts.
    pub(crate) fn max_allowed_day(&self) -> i64 {
        day_from_nsecs(now_nsecs() + self.future_retention.as_nanos() as i64)
    }

    fn lookup_or_create_partition(&self, day: i64) -> Result<Option<Arc<PartitionHandle>>> {
        self.partition_set.lookup_or_create(day, |day| {
            let path = self.partitions_path.join(partition_name(day));
            partition::create_partition(&path)?;
            partition::open_partition(&path, self.flush_interval, self.log_ingested_rows)
        })
    }
}

/// A logs storage rooted at one directory, exclusively owned by this
/// process until [`Storage::close`].
pub struct Storage {
    core: Arc<StorageCore>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Storage {
    /// Opens (creating it if needed) the storage at `path`.
    ///
    /// Recovers the existing partitions, finishes interrupted partition
    /// deletions, drops partitions beyond the future retention and
    /// starts the retention watchers. [`Storage::close`] must be called
    /// before dropping the value.
    pub async fn open(
        path: impl Into<PathBuf>,
        config: &StorageConfig,
    ) -> Result<Storage, StorageError> {
        let path = path.into();
        let flush_interval = config.flush_interval.max(Duration::from_secs(1));
        let retention = config.retention.max(Duration::from_secs(24 * 3600));
        let future_retention = config.future_retention.max(Duration::from_secs(24 * 3600));

        fs::create_dir_all(&path)
            .with_context(|| format!("cannot create storage dir {}", path.display()))?;
        let partitions_path = path.join(PARTITIONS_DIRNAME);
        fs::create_dir_all(&partitions_path)
            .with_context(|| format!("cannot create partitions dir {}", partitions_path.display()))?;

        let lock_path = path.join(FLOCK_FILENAME);
        let Some(flock_file) = fs_util::try_lock_file(&lock_path)? else {
            return Err(StorageError::AlreadyOpen { path, lock_path });
        };

        let core = Arc::new(StorageCore {
            path,
            partitions_path,
            retention,
            max_disk_space_usage_bytes: config.max_disk_space_usage_bytes,
            flush_interval,
            future_retention,
            min_free_disk_space_bytes: config.min_free_disk_space_bytes,
            log_new_streams: config.log_new_streams,
            log_ingested_rows: config.log_ingested_rows,
            flock_file: Mutex::new(Some(flock_file)),
            partition_set: PartitionSet::new(),
            stream_id_cache: StreamIdCache::new(),
            rows_dropped_too_small_ts: AtomicU64::new(0),
            rows_dropped_too_big_ts: AtomicU64::new(0),
        });

        let mut handles = open_all_partitions(&core).await?;
        handles.sort_by_key(|h| h.day());

        // Delete partitions from the future, newest first.
        let max_allowed_day = core.max_allowed_day();
        while handles.last().is_some_and(|h| h.day() > max_allowed_day) {
            let handle = handles.pop().expect("last() was Some");
            info!(
                "partition {} is scheduled for deletion: it is beyond the configured future retention of {:?}",
                handle.partition().path().display(),
                future_retention,
            );
            handle.mark_must_drop();
            handle.release();
        }

        core.partition_set.install(handles);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = vec![tokio::spawn(retention::run_retention_watcher(
            Arc::clone(&core),
            stop_rx.clone(),
        ))];
        if core.max_disk_space_usage_bytes > 0 {
            workers.push(tokio::spawn(retention::run_disk_usage_watcher(
                Arc::clone(&core),
                stop_rx,
            )));
        }

        Ok(Storage {
            core,
            stop_tx,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    /// Stops the background watchers and releases every partition and
    /// the lock file.
    ///
    /// All handles taken by callers must have been released first;
    /// anything else is a bug and panics. Nothing in-memory is
    /// persisted: the stream cache is rebuilt lazily after the next
    /// open because partition directories may be restored, copied or
    /// deleted out of band between runs.
    pub async fn close(&self) {
        assert!(
            !self.closed.swap(true, Ordering::AcqRel),
            "BUG: storage closed twice"
        );
        let _ = self.stop_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(err) = worker.await {
                error!("retention watcher failed: {err}");
            }
        }

        for handle in self.core.partition_set.drain() {
            handle.release();
            let refs = handle.ref_count();
            assert!(
                refs == 0,
                "BUG: there are {refs} users of partition {} at close",
                handle.partition().name()
            );
        }

        self.core.stream_id_cache.stop();

        *self.core.flock_file.lock().unwrap() = None;
    }

    /// Adds `batch` to the storage.
    ///
    /// Best effort and infallible: entries outside the admissible time
    /// window are dropped and counted, partition-level failures are
    /// logged. Callers are expected to consult
    /// [`Storage::is_read_only`] before heavy ingestion.
    ///
    /// Added rows become visible to search after a short while; call
    /// [`Storage::debug_flush`] to see them immediately (tests only).
    pub fn add_rows(&self, batch: &LogBatch) {
        if batch.is_empty() {
            return;
        }

        // Fast path: consecutive batches usually all land on the hot
        // partition's day.
        if let Some(hot) = self.core.partition_set.take_hot() {
            if hot.can_add_all_rows(batch) {
                self.add_rows_to_partition(&hot, batch);
                hot.release();
                return;
            }
            hot.release();
        }

        self.add_rows_slow(batch);
    }

    /// Splits a mixed-day batch per day and routes each sub-batch.
    fn add_rows_slow(&self, batch: &LogBatch) {
        let min_allowed_day = self.core.min_allowed_day();
        let max_allowed_day = self.core.max_allowed_day();

        let mut per_day: BTreeMap<i64, LogBatch> = BTreeMap::new();
        for idx in 0..batch.len() {
            let entry = batch.get(idx);
            let day = day_from_nsecs(entry.timestamp);
            if day < min_allowed_day {
                if throttle::should_log("too_small_timestamp", throttle::DEFAULT_PERIOD) {
                    warn!(
                        "skipping log entry with too small timestamp {}; it must be bigger than {} according to the configured retention of {:?}",
                        TimestampDisplay(entry.timestamp),
                        TimestampDisplay(day_min_timestamp(min_allowed_day)),
                        self.core.retention,
                    );
                }
                self.core.rows_dropped_too_small_ts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if day > max_allowed_day {
                if throttle::should_log("too_big_timestamp", throttle::DEFAULT_PERIOD) {
                    warn!(
                        "skipping log entry with too big timestamp {}; it must be smaller than {} according to the configured future retention of {:?}",
                        TimestampDisplay(entry.timestamp),
                        TimestampDisplay(day_min_timestamp(max_allowed_day + 1)),
                        self.core.future_retention,
                    );
                }
                self.core.rows_dropped_too_big_ts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            per_day.entry(day).or_insert_with(LogBatch::acquire).push(
                entry.timestamp,
                entry.stream_id,
                entry.stream_tags.clone(),
                entry.fields.clone(),
            );
        }

        for (day, sub_batch) in per_day {
            match self.core.lookup_or_create_partition(day) {
                Ok(Some(handle)) => {
                    self.add_rows_to_partition(&handle, &sub_batch);
                    handle.release();
                }
                Ok(None) => {
                    // The day fell below the retention floor between the
                    // admission check and here: a reaper evicted it for
                    // good, so these rows are late by definition.
                    if throttle::should_log("retention_evicted", throttle::DEFAULT_PERIOD) {
                        warn!(
                            "skipping {} log entries for day {}: the partition was dropped by retention",
                            sub_batch.len(),
                            partition_name(day),
                        );
                    }
                    self.core
                        .rows_dropped_too_small_ts
                        .fetch_add(sub_batch.len() as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    error!("cannot create partition for day {}: {err:#}", partition_name(day));
                }
            }
            LogBatch::recycle(sub_batch);
        }
    }

    fn add_rows_to_partition(&self, handle: &PartitionHandle, batch: &LogBatch) {
        if let Err(err) = handle.partition().add_rows(batch) {
            error!(
                "cannot add {} rows to partition {}: {err:#}",
                batch.len(),
                handle.partition().name()
            );
            return;
        }
        let day = handle.day();
        for idx in 0..batch.len() {
            let stream_id = batch.get(idx).stream_id;
            if self.core.stream_id_cache.mark_seen(day, stream_id) && self.core.log_new_streams {
                debug!(
                    "new log stream {stream_id} in partition {}",
                    handle.partition().name()
                );
            }
        }
    }

    /// Accumulates the storage counters and per-partition stats into
    /// `stats`.
    pub fn update_stats(&self, stats: &mut StorageStats) {
        stats.rows_dropped_too_small_timestamp +=
            self.core.rows_dropped_too_small_ts.load(Ordering::Relaxed);
        stats.rows_dropped_too_big_timestamp +=
            self.core.rows_dropped_too_big_ts.load(Ordering::Relaxed);
        stats.partitions_count +=
            self.core.partition_set.update_stats(&mut stats.partition_stats) as u64;
        stats.is_read_only = self.is_read_only();
    }

    /// True when the free space at the storage path fell under the
    /// configured threshold.
    pub fn is_read_only(&self) -> bool {
        match fs_util::free_disk_space(&self.core.path) {
            Ok(free) => free < self.core.min_free_disk_space_bytes,
            Err(err) => {
                error!("cannot query free disk space at {}: {err:#}", self.core.path.display());
                false
            }
        }
    }

    /// Force-merges the parts of every partition whose name starts with
    /// `partition_name_prefix` (all of them for an empty prefix).
    ///
    /// Partitions are merged sequentially to bound the load.
    pub fn force_merge(&self, partition_name_prefix: &str) {
        for handle in self.core.partition_set.snapshot_matching(partition_name_prefix) {
            info!("started force merge for partition {}", handle.partition().name());
            let start = Instant::now();
            if let Err(err) = handle.partition().force_merge() {
                error!("cannot force merge partition {}: {err:#}", handle.partition().name());
            }
            handle.release();
            info!(
                "finished force merge for partition {} in {:.3}s",
                handle.partition().name(),
                start.elapsed().as_secs_f64()
            );
        }
    }

    /// Flushes all buffered rows so they become visible to search.
    ///
    /// For debugging and tests only: it defeats the flush cadence.
    pub fn debug_flush(&self) {
        for handle in self.core.partition_set.snapshot() {
            if let Err(err) = handle.partition().debug_flush() {
                error!("cannot flush partition {}: {err:#}", handle.partition().name());
            }
            handle.release();
        }
    }
}

fn now_nsecs() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Enumerates `partitions/`, finishes interrupted deletions and opens
/// the remaining partition directories in parallel, bounded by the
/// available CPUs.
async fn open_all_partitions(core: &Arc<StorageCore>) -> Result<Vec<Arc<PartitionHandle>>> {
    let mut day_dirs = Vec::new();
    let entries = fs::read_dir(&core.partitions_path)
        .with_context(|| format!("cannot read partitions dir {}", core.partitions_path.display()))?;
    for entry in entries {
        let entry = entry?;
        let dir = entry.path();
        if partition::is_partially_removed(&dir) {
            info!("finishing interrupted deletion of partition {}", dir.display());
            partition::delete_partition(&dir)?;
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| anyhow!("partition dir name {name:?} is not utf-8"))?;
        let day = parse_partition_name(&name)
            .with_context(|| format!("unrecognized entry in {}", core.partitions_path.display()))?;
        day_dirs.push((day, dir));
    }

    let concurrency = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set = JoinSet::new();
    for (day, dir) in day_dirs {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("the semaphore is never closed");
        let flush_interval = core.flush_interval;
        let log_ingested_rows = core.log_ingested_rows;
        join_set.spawn_blocking(move || {
            let _permit = permit;
            let pt = partition::open_partition(&dir, flush_interval, log_ingested_rows)
                .with_context(|| format!("cannot open partition {}", dir.display()))?;
            Ok::<_, anyhow::Error>(PartitionHandle::new(pt, day))
        });
    }

    let mut handles = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        handles.push(joined.context("partition open task failed")??);
    }
    Ok(handles)
}
