//! In-memory cache for stream lookups during ingestion
//!
//! The cache is rebuilt lazily after every restart: partitions may be
//! restored from backups, copied between hosts or deleted out of band
//! between runs, so persisting it would let it drift out of sync with
//! the on-disk state.

use crate::log_batch::StreamId;
use moka::sync::Cache;

const STREAM_ID_CACHE_CAPACITY: u64 = 1024 * 1024;

/// Caches (day, stream id) pairs seen during ingestion.
///
/// Spares the partition the registration check for streams it already
/// knows, and lets the router log the first sighting of a stream when
/// `log_new_streams` is enabled.
pub(crate) struct StreamIdCache {
    cache: Cache<(i64, StreamId), ()>,
}

impl StreamIdCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().max_capacity(STREAM_ID_CACHE_CAPACITY).build(),
        }
    }

    /// Returns true on the first sighting of the (day, stream) pair.
    pub fn mark_seen(&self, day: i64, stream_id: StreamId) -> bool {
        let key = (day, stream_id);
        if self.cache.contains_key(&key) {
            return false;
        }
        self.cache.insert(key, ());
        true
    }

    pub fn stop(&self) {
        self.cache.invalidate_all();
    }
}
