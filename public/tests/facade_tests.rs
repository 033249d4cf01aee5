//! Smoke test of the public facade: the whole ingest surface must be
//! reachable through `strata::`.

use strata::bytes::Bytes;
use strata::chrono::Utc;
use strata::logstorage::log_batch::{LogBatch, StreamId};
use strata::logstorage::storage::{Storage, StorageConfig, StorageStats};

#[tokio::test]
async fn ingest_through_the_facade() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path(), &StorageConfig::default()).await.unwrap();

    let mut batch = LogBatch::new();
    batch.push(
        Utc::now().timestamp_nanos_opt().unwrap(),
        StreamId(1),
        Bytes::from_static(b"service=gateway"),
        Bytes::from_static(b"_msg=started"),
    );
    storage.add_rows(&batch);
    storage.debug_flush();

    let mut stats = StorageStats::default();
    storage.update_stats(&mut stats);
    assert_eq!(stats.partitions_count, 1);
    assert_eq!(stats.partition_stats.rows_count, 1);

    storage.close().await;
}
