//! Strata logstorage: time-partitioned storage for ingested log entries.
//!
//! Log rows land in one partition per UTC calendar day under
//! `<storage>/partitions/YYYYMMDD`. The storage routes incoming batches
//! to the right partitions, keeps a hot-partition fast path for the
//! common all-on-today case, and evicts old partitions in the
//! background by age and by disk budget while concurrent readers keep
//! their handles valid.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Stream-id lookup cache used during ingestion
mod cache;
/// Errors surfaced by the storage API
pub mod error;
/// Lock files, free-space probing and directory durability
mod fs_util;
/// Batches of parsed log entries handed in by ingestion front-ends
pub mod log_batch;
/// The per-day partition engine
pub mod partition;
/// Reference-counted partition handles and the sorted live set
mod partition_set;
/// Background eviction by age and by disk budget
mod retention;
/// The storage: lifecycle, ingest routing, stats
pub mod storage;
/// Throttling of repetitive warnings
mod throttle;
/// Day keys, partition names and timestamp formatting
pub mod time_util;
