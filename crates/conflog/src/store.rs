//! Configuration Store
//!
//! `ConfStore` composes the two tiers:
//!
//! ```text
//!            push ──────────────▶ DiskLog ──▶ fsync    (durability first)
//!                                    │
//!                                    ▼
//!                              RangeSkipList           (then the cache)
//!
//!            get ───▶ RangeSkipList ──miss──▶ DiskLog  (memory first)
//! ```
//!
//! Writes go to disk before the cache: a push is acknowledged only once
//! its record is durable, and a cache insert that fails afterwards is
//! logged and swallowed — a size cap is not a durability concern. Reads
//! try the cache and fall through to disk on a miss. On open, the cache is
//! warmed with the newest segment's records, so `last()` never needs a
//! disk fallback.
//!
//! The store is single-writer, multi-reader: each tier sits behind a
//! `parking_lot::RwLock`; mutating operations take the write locks, reads
//! share the read locks. All I/O is blocking and there are no background
//! tasks.

use std::path::Path;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::disk_log::DiskLog;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::skiplist::RangeSkipList;

/// Durable, range-indexed log of configuration snapshots.
pub struct ConfStore {
    disk: RwLock<DiskLog>,
    cache: RwLock<RangeSkipList>,
}

impl ConfStore {
    /// Open a store in `dir` with the given file prefix and default
    /// limits.
    pub fn open(dir: impl AsRef<Path>, file_prefix: impl Into<String>) -> Result<Self> {
        Self::open_with(StoreConfig::new(dir, file_prefix))
    }

    /// Open a store with explicit configuration. Loads every segment,
    /// then warms the cache from the newest one.
    pub fn open_with(config: StoreConfig) -> Result<Self> {
        let disk = DiskLog::open(&config)?;

        let mut cache = RangeSkipList::new(
            config.cache_max_records,
            config.cache_evict_batch,
            config.list_result_cap,
        );
        let warmup = disk.list_of_latest_segment()?;
        let warmed = warmup.len();
        for record in warmup {
            cache.push(Record::open_ended(record.start_id, record.payload))?;
        }
        info!(records = warmed, "cache warmed from newest segment");

        Ok(Self {
            disk: RwLock::new(disk),
            cache: RwLock::new(cache),
        })
    }

    /// Durably append the configuration taking effect at `log_index`.
    ///
    /// Fails with `InvalidOrdering` when `log_index` does not exceed the
    /// previous record's start id. Cache-side failures do not fail the
    /// push — the record is already durable.
    pub fn push(&self, log_index: u64, payload: Bytes) -> Result<()> {
        self.disk.write().append(log_index, payload.clone())?;

        if let Err(err) = self
            .cache
            .write()
            .push(Record::open_ended(log_index, payload))
        {
            warn!(log_index, error = %err, "durable record not cached");
        }
        Ok(())
    }

    /// The record whose range contains `log_index`.
    pub fn get(&self, log_index: u64) -> Result<Record> {
        match self.cache.read().get(log_index) {
            Ok(record) => Ok(record),
            Err(Error::NotFound) => self.disk.read().get(log_index),
            Err(err) => Err(err),
        }
    }

    /// The newest record. The cache always holds it, so this never
    /// touches disk.
    pub fn last(&self) -> Result<Record> {
        self.cache.read().last()
    }

    /// Every record whose range reaches `log_index` or higher, ascending.
    /// Served from the cache, with the evicted prefix read back from disk
    /// and prepended.
    pub fn list_after(&self, log_index: u64) -> Result<Vec<Record>> {
        let cached = self.cache.read().list_after(log_index);

        match cached.first() {
            None => self.disk.read().list_after(log_index),
            Some(first) if first.start_id > log_index => {
                let mut result = self
                    .disk
                    .read()
                    .list_between(log_index, first.start_id - 1)?;
                result.extend(cached);
                Ok(result)
            }
            Some(_) => Ok(cached),
        }
    }

    /// Drop everything below `log_index`, disk first. Disk is the source
    /// of truth; the cache follows.
    pub fn truncate_before(&self, log_index: u64) -> Result<()> {
        self.disk.write().truncate_before(log_index)?;
        self.cache.write().truncate_before(log_index);
        Ok(())
    }

    /// Drop everything above `log_index`, disk first. The surviving
    /// newest record becomes open-ended again.
    pub fn truncate_after(&self, log_index: u64) -> Result<()> {
        self.disk.write().truncate_after(log_index)?;
        self.cache.write().truncate_after(log_index);
        Ok(())
    }

    /// Number of records currently resident in the cache tier.
    pub fn cached_records(&self) -> usize {
        self.cache.read().len()
    }

    /// Flush every index header and the active data file.
    pub fn close(&self) -> Result<()> {
        self.disk.write().close()
    }
}
