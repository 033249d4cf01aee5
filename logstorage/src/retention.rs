//! Background eviction of partitions: by age and by disk budget

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::storage::StorageCore;
use crate::time_util::add_jitter;

const RETENTION_TICK: Duration = Duration::from_secs(3600);
const DISK_USAGE_TICK: Duration = Duration::from_secs(10);

/// Drops partitions older than the configured retention.
///
/// Runs until the stop channel flips; the first pass happens right away
/// so a storage reopened after downtime catches up without waiting a
/// full tick.
pub(crate) async fn run_retention_watcher(
    core: Arc<StorageCore>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(add_jitter(RETENTION_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        retention_tick(&core);
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }
    }
}

/// Keeps the total partition footprint under the configured disk budget.
pub(crate) async fn run_disk_usage_watcher(
    core: Arc<StorageCore>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(add_jitter(DISK_USAGE_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        disk_usage_tick(&core);
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }
    }
}

/// One pass of age-based eviction.
///
/// The retention floor is advanced inside the set mutex before the
/// storage's references are released here, so ingestion cannot re-create
/// a day that is being dropped.
pub(crate) fn retention_tick(core: &StorageCore) {
    let min_allowed_day = core.min_allowed_day();
    for handle in core.partition_set.evict_older_than(min_allowed_day) {
        info!(
            "partition {} is scheduled for deletion: it is older than the configured retention of {:?}",
            handle.partition().path().display(),
            core.retention,
        );
        handle.mark_must_drop();
        handle.release();
    }
}

/// One pass of disk-budget eviction. The two newest partitions are never
/// evicted, whatever the budget says.
pub(crate) fn disk_usage_tick(core: &StorageCore) {
    for handle in core.partition_set.evict_over_disk_budget(core.max_disk_space_usage_bytes) {
        info!(
            "partition {} is scheduled for deletion: the total size of partitions exceeds the disk budget of {} bytes",
            handle.partition().path().display(),
            core.max_disk_space_usage_bytes,
        );
        handle.mark_must_drop();
        handle.release();
    }
}
