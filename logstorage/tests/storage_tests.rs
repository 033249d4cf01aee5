use bytes::Bytes;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_logstorage::error::StorageError;
use strata_logstorage::log_batch::{LogBatch, StreamId};
use strata_logstorage::storage::{Storage, StorageConfig, StorageStats};
use strata_logstorage::time_util::{day_from_nsecs, day_min_timestamp, partition_name};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn now_nsecs() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap()
}

fn today() -> i64 {
    day_from_nsecs(now_nsecs())
}

fn partition_dir(storage_path: &Path, day: i64) -> PathBuf {
    storage_path.join("partitions").join(partition_name(day))
}

fn batch(entries: &[(i64, u128)]) -> LogBatch {
    let mut batch = LogBatch::new();
    for &(ts, sid) in entries {
        batch.push(
            ts,
            StreamId(sid),
            Bytes::from_static(b"app=web,env=prod"),
            Bytes::from_static(b"_msg=GET /healthz 200"),
        );
    }
    batch
}

fn stats_of(storage: &Storage) -> StorageStats {
    let mut stats = StorageStats::default();
    storage.update_stats(&mut stats);
    stats
}

#[tokio::test]
async fn single_day_batch_lands_in_one_partition() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();

    let now = now_nsecs();
    storage.add_rows(&batch(&[(now, 1), (now + 1, 1), (now + 2, 2)]));
    storage.debug_flush();

    let stats = stats_of(&storage);
    assert_eq!(stats.partitions_count, 1);
    assert_eq!(stats.partition_stats.rows_count, 3);
    assert_eq!(stats.rows_dropped_too_small_timestamp, 0);
    assert_eq!(stats.rows_dropped_too_big_timestamp, 0);
    assert!(partition_dir(dir.path(), today()).exists());

    // the hot fast path takes the follow-up batch without creating
    // anything new
    storage.add_rows(&batch(&[(now + 3, 1)]));
    storage.debug_flush();
    let stats = stats_of(&storage);
    assert_eq!(stats.partitions_count, 1);
    assert_eq!(stats.partition_stats.rows_count, 4);

    storage.close().await;
}

#[tokio::test]
async fn mixed_day_batch_is_split_per_day() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();

    let now = now_nsecs();
    let yesterday = day_min_timestamp(today() - 1) + 42;
    storage.add_rows(&batch(&[(now, 1), (now + 1, 1), (yesterday, 2)]));
    storage.debug_flush();

    let stats = stats_of(&storage);
    assert_eq!(stats.partitions_count, 2);
    assert_eq!(stats.partition_stats.rows_count, 3);
    assert_eq!(stats.rows_dropped_too_small_timestamp, 0);
    assert_eq!(stats.rows_dropped_too_big_timestamp, 0);
    assert!(partition_dir(dir.path(), today()).exists());
    assert!(partition_dir(dir.path(), today() - 1).exists());

    storage.close().await;
}

#[tokio::test]
async fn second_open_fails_until_the_first_closes() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();

    match Storage::open(dir.path(), &StorageConfig::default()).await {
        Err(StorageError::AlreadyOpen { .. }) => {}
        Err(other) => panic!("expected AlreadyOpen, got {other:?}"),
        Ok(_) => panic!("expected AlreadyOpen, got an open storage"),
    }

    storage.close().await;

    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();
    storage.close().await;
}

#[tokio::test]
async fn partitions_survive_a_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();

    let now = now_nsecs();
    let yesterday = day_min_timestamp(today() - 1) + 7;
    storage.add_rows(&batch(&[(now, 1), (yesterday, 2)]));
    storage.debug_flush();
    storage.close().await;

    assert!(partition_dir(dir.path(), today()).exists());
    assert!(partition_dir(dir.path(), today() - 1).exists());

    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();
    let stats = stats_of(&storage);
    assert_eq!(stats.partitions_count, 2);
    assert_eq!(stats.partition_stats.rows_count, 2);
    storage.close().await;
}

#[tokio::test]
async fn old_entries_are_dropped_and_counted_not_failed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        retention: Duration::from_secs(24 * 3600),
        ..Default::default()
    };
    let storage = Storage::open(dir.path(), &config).await.unwrap();

    let stale = day_min_timestamp(today() - 10);
    storage.add_rows(&batch(&[(stale, 1), (stale + 1, 1)]));

    let stats = stats_of(&storage);
    assert_eq!(stats.rows_dropped_too_small_timestamp, 2);
    assert_eq!(stats.partitions_count, 0);
    assert!(!partition_dir(dir.path(), today() - 10).exists());

    storage.close().await;
}

#[tokio::test]
async fn min_allowed_day_boundary_is_admitted() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        retention: Duration::from_secs(48 * 3600),
        ..Default::default()
    };
    let storage = Storage::open(dir.path(), &config).await.unwrap();

    // first nanosecond of the oldest allowed day
    let min_allowed_day = day_from_nsecs(now_nsecs() - 48 * 3600 * 1_000_000_000);
    storage.add_rows(&batch(&[(day_min_timestamp(min_allowed_day), 1)]));
    storage.debug_flush();

    let stats = stats_of(&storage);
    assert_eq!(stats.rows_dropped_too_small_timestamp, 0);
    assert_eq!(stats.partition_stats.rows_count, 1);
    assert!(partition_dir(dir.path(), min_allowed_day).exists());

    storage.close().await;
}

#[tokio::test]
async fn future_dated_partitions_are_dropped_at_open() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        future_retention: Duration::from_secs(24 * 3600),
        ..Default::default()
    };

    // seed a storage with partitions for today, tomorrow and far future
    let storage = Storage::open(dir.path(), &config).await.unwrap();
    let now = now_nsecs();
    let tomorrow = day_min_timestamp(today() + 1);
    storage.add_rows(&batch(&[(now, 1), (tomorrow, 2)]));
    storage.debug_flush();
    storage.close().await;
    // a partition from a run with a much bigger future retention
    std::fs::create_dir_all(partition_dir(dir.path(), today() + 30).join("small")).unwrap();
    std::fs::create_dir_all(partition_dir(dir.path(), today() + 30).join("big")).unwrap();
    std::fs::write(
        partition_dir(dir.path(), today() + 30).join("streams.idx"),
        b"SLSIDX01",
    )
    .unwrap();

    let storage = Storage::open(dir.path(), &config).await.unwrap();
    // tomorrow == max allowed day: kept; +30 days: deleted
    assert!(partition_dir(dir.path(), today()).exists());
    assert!(partition_dir(dir.path(), today() + 1).exists());
    assert!(!partition_dir(dir.path(), today() + 30).exists());
    let stats = stats_of(&storage);
    assert_eq!(stats.partitions_count, 2);

    storage.close().await;
}

#[tokio::test]
async fn interrupted_partition_deletion_is_finished_at_open() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();
    storage.add_rows(&batch(&[(now_nsecs(), 1)]));
    storage.debug_flush();
    storage.close().await;

    // simulate a crash half-way through a deletion
    let doomed = partition_dir(dir.path(), today());
    std::fs::write(doomed.join(".deleting"), b"").unwrap();

    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();
    assert!(!doomed.exists());
    let stats = stats_of(&storage);
    assert_eq!(stats.partitions_count, 0);
    storage.close().await;
}

#[tokio::test]
async fn unrecognized_partition_entries_are_fatal() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();
    storage.close().await;

    std::fs::create_dir(dir.path().join("partitions").join("not-a-day")).unwrap();
    match Storage::open(dir.path(), &StorageConfig::default()).await {
        Err(StorageError::Startup(_)) => {}
        Err(other) => panic!("expected a fatal startup error, got {other:?}"),
        Ok(_) => panic!("expected a fatal startup error, got an open storage"),
    }
}

#[tokio::test]
async fn read_only_mode_tracks_the_free_space_threshold() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        min_free_disk_space_bytes: 0,
        ..Default::default()
    };
    let storage = Storage::open(dir.path(), &config).await.unwrap();
    assert!(!storage.is_read_only());
    assert!(!stats_of(&storage).is_read_only);
    storage.close().await;

    let config = StorageConfig {
        min_free_disk_space_bytes: u64::MAX,
        ..Default::default()
    };
    let storage = Storage::open(dir.path(), &config).await.unwrap();
    assert!(storage.is_read_only());
    storage.close().await;
}
