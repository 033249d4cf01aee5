//! Strata is a time-partitioned storage engine for log entries.
//!
//! Ingested logs are laid out on local disk as one partition per UTC
//! calendar day:
//!
//! ```text
//! <storage>/
//! ├── flock.lock            exclusive-open lock, one process at a time
//! └── partitions/
//!     ├── 20240614/         yesterday's rows, parts and stream index
//!     └── 20240615/         today's rows; the ingest hot path
//! ```
//!
//! Batches of parsed log entries go through
//! [`logstorage::storage::Storage::add_rows`]; entries older than the
//! retention window or too far in the future are dropped and counted
//! instead of failing the batch. Two background watchers evict whole
//! partitions: one by age, one by total disk usage (always keeping the
//! two newest days queryable). Partitions stay valid for concurrent
//! readers until the last reference goes away, even when a watcher
//! drops them meanwhile.
//!
//! # Opening a storage
//!
//! ```no_run
//! use strata::logstorage::storage::{Storage, StorageConfig};
//!
//! # async fn open_it() -> Result<(), strata::logstorage::error::StorageError> {
//! let config = StorageConfig::default();
//! let storage = Storage::open("/var/lib/strata", &config).await?;
//! // ... ingest, query, ...
//! storage.close().await;
//! # Ok(())
//! # }
//! ```

pub use bytes;
pub use chrono;
pub use tokio;
pub use tracing;

pub use strata_logstorage as logstorage;
