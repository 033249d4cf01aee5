//! Batches of parsed log entries handed to the storage by ingestion
//! front-ends

use bytes::Bytes;
use lazy_static::lazy_static;
use std::fmt;
use std::sync::Mutex;

/// Opaque 128-bit identifier of a log stream.
///
/// Computed by the ingestion front-ends from the canonical stream tags;
/// the storage only compares and registers it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u128);

impl StreamId {
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(b))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({:032x})", self.0)
    }
}

/// Borrowed view of a single entry of a [`LogBatch`].
pub struct LogEntryRef<'a> {
    pub timestamp: i64,
    pub stream_id: StreamId,
    pub stream_tags: &'a Bytes,
    pub fields: &'a Bytes,
}

/// An ordered batch of log entries.
///
/// Stored as a struct of arrays: the ingest router scans timestamps
/// without touching the payload columns. The batch is produced by the
/// ingestion front-ends; the storage only reads it, and splits it into
/// pooled per-day sub-batches when entries span multiple days.
#[derive(Default)]
pub struct LogBatch {
    timestamps: Vec<i64>,
    stream_ids: Vec<StreamId>,
    stream_tags: Vec<Bytes>,
    fields: Vec<Bytes>,
}

impl LogBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Appends one entry, keeping submission order.
    pub fn push(&mut self, timestamp: i64, stream_id: StreamId, stream_tags: Bytes, fields: Bytes) {
        self.timestamps.push(timestamp);
        self.stream_ids.push(stream_id);
        self.stream_tags.push(stream_tags);
        self.fields.push(fields);
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Per-entry access by index.
    ///
    /// Panics if `idx` is out of bounds, like slice indexing.
    pub fn get(&self, idx: usize) -> LogEntryRef<'_> {
        LogEntryRef {
            timestamp: self.timestamps[idx],
            stream_id: self.stream_ids[idx],
            stream_tags: &self.stream_tags[idx],
            fields: &self.fields[idx],
        }
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.stream_ids.clear();
        self.stream_tags.clear();
        self.fields.clear();
    }

    /// Takes a cleared batch from the process-wide pool.
    pub fn acquire() -> LogBatch {
        BATCH_POOL.lock().unwrap().pop().unwrap_or_default()
    }

    /// Returns a batch to the process-wide pool for reuse.
    pub fn recycle(mut batch: LogBatch) {
        batch.clear();
        let mut pool = BATCH_POOL.lock().unwrap();
        if pool.len() < MAX_POOLED_BATCHES {
            pool.push(batch);
        }
    }
}

const MAX_POOLED_BATCHES: usize = 64;

lazy_static! {
    static ref BATCH_POOL: Mutex<Vec<LogBatch>> = Mutex::new(Vec::new());
}
