//! Reference-counted partition handles and the sorted live-partition set

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use crate::log_batch::LogBatch;
use crate::partition::{self, Partition, PartitionStats};
use crate::time_util::{day_max_timestamp, day_min_timestamp};

/// A live partition plus its lifetime bookkeeping.
///
/// The storage owns one reference; every transient user (ingest router,
/// reaper, stats, merge) takes an additional one around each use. When
/// the count drops to zero the partition is closed, and deleted from
/// disk if it was marked for dropping. The `Arc` only keeps the memory
/// alive; close/delete are driven by the explicit counter so their
/// ordering stays deterministic.
pub(crate) struct PartitionHandle {
    day: i64,
    ref_count: AtomicI32,
    must_drop: AtomicBool,
    partition: Partition,
}

impl PartitionHandle {
    /// Wraps a freshly opened partition. The initial reference belongs
    /// to the storage.
    pub fn new(partition: Partition, day: i64) -> Arc<Self> {
        Arc::new(Self {
            day,
            ref_count: AtomicI32::new(1),
            must_drop: AtomicBool::new(false),
            partition,
        })
    }

    pub fn day(&self) -> i64 {
        self.day
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Takes an additional reference.
    ///
    /// Only legal while holding a live reference, or under the set mutex
    /// with the handle still in the set.
    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; the last one closes the partition and, if it
    /// was marked, deletes its directory. Close and delete never call
    /// back into the partition set.
    pub fn release(&self) {
        let n = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(
            n >= 0,
            "BUG: partition {} released more times than acquired",
            self.partition.name()
        );
        if n > 0 {
            return;
        }
        if let Err(err) = self.partition.close() {
            error!("cannot close partition {}: {err:#}", self.partition.name());
        }
        if self.must_drop.load(Ordering::Acquire) {
            match partition::delete_partition(self.partition.path()) {
                Ok(()) => debug!("deleted partition dir {}", self.partition.path().display()),
                Err(err) => error!(
                    "cannot delete partition dir {}: {err:#}",
                    self.partition.path().display()
                ),
            }
        }
    }

    /// Marks the partition for physical deletion once the last reference
    /// is released.
    pub fn mark_must_drop(&self) {
        self.must_drop.store(true, Ordering::Release);
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// True iff every timestamp of `batch` belongs to this handle's day.
    pub fn can_add_all_rows(&self, batch: &LogBatch) -> bool {
        let min_ts = day_min_timestamp(self.day);
        let max_ts = day_max_timestamp(self.day);
        batch.timestamps().iter().all(|&ts| ts >= min_ts && ts <= max_ts)
    }
}

struct SetState {
    /// Sorted by day ascending; days are unique.
    partitions: Vec<Arc<PartitionHandle>>,
    /// The handle most recently used by ingestion. Advisory: either one
    /// of `partitions` or `None`.
    hot: Option<Arc<PartitionHandle>>,
    /// Smallest day ingestion may still create a partition for. Only
    /// ever advances, so a day evicted by a reaper cannot come back.
    min_retention_day: i64,
}

/// The set of live partitions, one mutex over list + hot + retention floor.
pub(crate) struct PartitionSet {
    state: Mutex<SetState>,
}

impl PartitionSet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SetState {
                partitions: Vec::new(),
                hot: None,
                min_retention_day: i64::MIN,
            }),
        }
    }

    /// Installs the recovered partitions at startup. `handles` must be
    /// sorted by day.
    pub fn install(&self, handles: Vec<Arc<PartitionHandle>>) {
        debug_assert!(handles.windows(2).all(|w| w[0].day() < w[1].day()));
        let mut state = self.state.lock().unwrap();
        state.partitions = handles;
    }

    /// Looks up the partition covering `day`, creating it through
    /// `factory` when missing.
    ///
    /// Returns `None` when the day lies below the retention floor: the
    /// partition was dropped for good and must not be re-created. The
    /// factory runs under the set mutex, which serializes creation and
    /// closes the window where two routers could create the same day.
    pub fn lookup_or_create(
        &self,
        day: i64,
        factory: impl FnOnce(i64) -> Result<Partition>,
    ) -> Result<Option<Arc<PartitionHandle>>> {
        let mut state = self.state.lock().unwrap();
        let handle = match state.partitions.binary_search_by_key(&day, |h| h.day()) {
            Ok(idx) => Arc::clone(&state.partitions[idx]),
            Err(idx) => {
                if day < state.min_retention_day {
                    return Ok(None);
                }
                let handle = PartitionHandle::new(factory(day)?, day);
                state.partitions.insert(idx, Arc::clone(&handle));
                handle
            }
        };
        handle.acquire();
        state.hot = Some(Arc::clone(&handle));
        Ok(Some(handle))
    }

    /// Returns the hot partition with a reference taken, if any.
    pub fn take_hot(&self) -> Option<Arc<PartitionHandle>> {
        let state = self.state.lock().unwrap();
        let hot = state.hot.clone();
        if let Some(handle) = &hot {
            handle.acquire();
        }
        hot
    }

    /// Removes every partition older than `min_allowed_day` from the set
    /// and returns them; the caller marks and releases them outside the
    /// lock.
    pub fn evict_older_than(&self, min_allowed_day: i64) -> Vec<Arc<PartitionHandle>> {
        let mut state = self.state.lock().unwrap();
        let idx = state.partitions.partition_point(|h| h.day() < min_allowed_day);
        Self::evict_prefix_locked(&mut state, idx)
    }

    /// Removes the oldest partitions whose cumulative footprint pushes
    /// the total over `max_bytes`. The two newest partitions always
    /// survive so at least one day of logs stays queryable.
    pub fn evict_over_disk_budget(&self, max_bytes: u64) -> Vec<Arc<PartitionHandle>> {
        let mut state = self.state.lock().unwrap();
        let partitions = &state.partitions;
        let mut total = 0u64;
        let mut cut = None;
        for idx in (0..partitions.len()).rev() {
            total += partitions[idx].partition().disk_usage_bytes();
            if total <= max_bytes {
                continue;
            }
            if idx + 2 >= partitions.len() {
                // never evict the two newest partitions
                continue;
            }
            cut = Some(idx + 1);
            break;
        }
        match cut {
            Some(idx) => Self::evict_prefix_locked(&mut state, idx),
            None => Vec::new(),
        }
    }

    fn evict_prefix_locked(state: &mut SetState, upto_idx: usize) -> Vec<Arc<PartitionHandle>> {
        if upto_idx == 0 {
            return Vec::new();
        }
        let evicted: Vec<_> = state.partitions.drain(..upto_idx).collect();
        let min_day = evicted.last().map(|h| h.day() + 1).unwrap_or(i64::MIN);
        if state.min_retention_day < min_day {
            state.min_retention_day = min_day;
        }
        if let Some(hot) = &state.hot
            && evicted.iter().any(|h| Arc::ptr_eq(h, hot))
        {
            state.hot = None;
        }
        evicted
    }

    /// Takes a reference on every partition and returns them, oldest
    /// first, for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<PartitionHandle>> {
        let state = self.state.lock().unwrap();
        for handle in &state.partitions {
            handle.acquire();
        }
        state.partitions.clone()
    }

    /// Like [`Self::snapshot`], restricted to partitions whose name
    /// starts with `prefix`.
    pub fn snapshot_matching(&self, prefix: &str) -> Vec<Arc<PartitionHandle>> {
        let state = self.state.lock().unwrap();
        let mut handles = Vec::new();
        for handle in &state.partitions {
            if handle.partition().name().starts_with(prefix) {
                handle.acquire();
                handles.push(Arc::clone(handle));
            }
        }
        handles
    }

    /// Empties the set at shutdown, returning the handles so the caller
    /// can release the storage's references.
    pub fn drain(&self) -> Vec<Arc<PartitionHandle>> {
        let mut state = self.state.lock().unwrap();
        state.hot = None;
        std::mem::take(&mut state.partitions)
    }

    /// Accumulates per-partition stats under the lock and returns the
    /// partition count.
    pub fn update_stats(&self, stats: &mut PartitionStats) -> usize {
        let state = self.state.lock().unwrap();
        for handle in &state.partitions {
            handle.partition().update_stats(stats);
        }
        state.partitions.len()
    }
}

#[cfg(test)]
impl PartitionSet {
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().partitions.len()
    }

    pub fn min_retention_day(&self) -> i64 {
        self.state.lock().unwrap().min_retention_day
    }

    pub fn days(&self) -> Vec<i64> {
        self.state.lock().unwrap().partitions.iter().map(|h| h.day()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{create_partition, open_partition};
    use crate::time_util::partition_name;
    use bytes::Bytes;
    use crate::log_batch::StreamId;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const FLUSH_INTERVAL: Duration = Duration::from_secs(3600);

    fn factory(root: &Path) -> impl Fn(i64) -> Result<Partition> + '_ {
        move |day| {
            let path = root.join(partition_name(day));
            create_partition(&path)?;
            open_partition(&path, FLUSH_INTERVAL, false)
        }
    }

    fn one_row_batch(day: i64) -> LogBatch {
        let mut batch = LogBatch::new();
        batch.push(
            day_min_timestamp(day) + 1,
            StreamId(1),
            Bytes::from_static(b"app=web"),
            Bytes::from_static(b"_msg=x"),
        );
        batch
    }

    fn release_all(handles: Vec<Arc<PartitionHandle>>) {
        for handle in handles {
            handle.release();
        }
    }

    #[test]
    fn days_stay_sorted_and_unique() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        for day in [19_905, 19_900, 19_903, 19_900] {
            let handle = set.lookup_or_create(day, factory(dir.path())).unwrap().unwrap();
            handle.release();
        }
        assert_eq!(set.days(), vec![19_900, 19_903, 19_905]);
        release_all(set.drain());
    }

    #[test]
    fn lookup_sets_hot_and_takes_a_reference() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        let handle = set.lookup_or_create(19_900, factory(dir.path())).unwrap().unwrap();
        assert_eq!(handle.ref_count(), 2);
        handle.release();

        let hot = set.take_hot().unwrap();
        assert_eq!(hot.day(), 19_900);
        assert_eq!(hot.ref_count(), 2);
        hot.release();
        release_all(set.drain());
    }

    #[test]
    fn eviction_advances_the_retention_floor() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        for day in 19_900..19_906 {
            set.lookup_or_create(day, factory(dir.path())).unwrap().unwrap().release();
        }

        let evicted = set.evict_older_than(19_902);
        assert_eq!(evicted.iter().map(|h| h.day()).collect::<Vec<_>>(), vec![19_900, 19_901]);
        assert_eq!(set.min_retention_day(), 19_902);
        for handle in evicted {
            handle.mark_must_drop();
            handle.release();
        }
        assert!(!dir.path().join(partition_name(19_900)).exists());
        assert!(!dir.path().join(partition_name(19_901)).exists());

        // the evicted day cannot be re-created
        assert!(set.lookup_or_create(19_901, factory(dir.path())).unwrap().is_none());
        release_all(set.drain());
    }

    #[test]
    fn eviction_empties_the_set_when_every_partition_is_outdated() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        for day in 19_900..19_903 {
            set.lookup_or_create(day, factory(dir.path())).unwrap().unwrap().release();
        }

        // the floor is beyond every partition: nothing survives
        let evicted = set.evict_older_than(19_910);
        assert_eq!(
            evicted.iter().map(|h| h.day()).collect::<Vec<_>>(),
            vec![19_900, 19_901, 19_902]
        );
        assert!(set.days().is_empty());
        assert!(set.take_hot().is_none());
        assert_eq!(set.min_retention_day(), 19_903);

        for handle in evicted {
            handle.mark_must_drop();
            handle.release();
        }
        for day in 19_900..19_903 {
            assert!(!dir.path().join(partition_name(day)).exists());
        }
    }

    #[test]
    fn evicting_the_hot_partition_clears_the_pointer() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        set.lookup_or_create(19_900, factory(dir.path())).unwrap().unwrap().release();
        set.lookup_or_create(19_901, factory(dir.path())).unwrap().unwrap().release();
        // hot is now 19_901; evict everything below 19_902
        let evicted = set.evict_older_than(19_902);
        assert!(set.take_hot().is_none());
        release_all(evicted);
    }

    #[test]
    fn disk_budget_eviction_keeps_the_two_newest() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        for day in 19_900..19_905 {
            let handle = set.lookup_or_create(day, factory(dir.path())).unwrap().unwrap();
            handle.partition().add_rows(&one_row_batch(day)).unwrap();
            handle.partition().debug_flush().unwrap();
            assert!(handle.partition().disk_usage_bytes() > 0);
            handle.release();
        }

        let evicted = set.evict_over_disk_budget(1);
        assert_eq!(
            evicted.iter().map(|h| h.day()).collect::<Vec<_>>(),
            vec![19_900, 19_901, 19_902]
        );
        assert_eq!(set.days(), vec![19_903, 19_904]);
        assert_eq!(set.min_retention_day(), 19_903);
        release_all(evicted);
        release_all(set.drain());
    }

    #[test]
    fn disk_budget_eviction_is_a_noop_under_the_limit() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        for day in 19_900..19_903 {
            set.lookup_or_create(day, factory(dir.path())).unwrap().unwrap().release();
        }
        assert!(set.evict_over_disk_budget(u64::MAX).is_empty());
        assert_eq!(set.len(), 3);
        release_all(set.drain());
    }

    #[test]
    fn reader_defers_deletion_until_release() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        set.lookup_or_create(19_900, factory(dir.path())).unwrap().unwrap().release();
        set.lookup_or_create(19_901, factory(dir.path())).unwrap().unwrap().release();

        // a reader grabs every partition
        let readers = set.snapshot();

        // the reaper evicts day 19_900 concurrently
        let evicted = set.evict_older_than(19_901);
        for handle in evicted {
            handle.mark_must_drop();
            handle.release();
        }

        // the directory survives while the reader holds its reference,
        // and the handle is still fully usable
        let path = dir.path().join(partition_name(19_900));
        assert!(path.exists());
        let mut stats = PartitionStats::default();
        readers[0].partition().update_stats(&mut stats);

        release_all(readers);
        assert!(!path.exists());
        release_all(set.drain());
    }

    #[test]
    #[should_panic(expected = "released more times than acquired")]
    fn releasing_below_zero_panics() {
        let dir = TempDir::new().unwrap();
        let set = PartitionSet::new();
        let handle = set.lookup_or_create(19_900, factory(dir.path())).unwrap().unwrap();
        handle.release(); // router's reference
        release_all(set.drain()); // owner's reference; count is now zero
        handle.release();
    }
}
