//! # conflog
//!
//! A durable, range-indexed log of configuration snapshots keyed by
//! monotonically increasing 64-bit log indices. It underpins a consensus
//! runtime: each committed configuration change is pushed with the log
//! index at which it took effect, and later queries ask "what
//! configuration was in force at log index N?" or "give me every
//! configuration from log index N onward".
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      ConfStore                        │
//! │        disk-first writes · memory-first reads         │
//! └───────────────┬──────────────────────┬───────────────┘
//!                 │                      │
//!                 ▼                      ▼
//! ┌───────────────────────┐  ┌───────────────────────────┐
//! │       DiskLog         │  │      RangeSkipList        │
//! │  segment data files   │  │  newest suffix in memory  │
//! │  + sparse index files │  │  bounded, range-keyed     │
//! └───────────────────────┘  └───────────────────────────┘
//! ```
//!
//! - [`DiskLog`] stores variable-length records in 512-byte-aligned slots
//!   across 2 MiB segment files, each with a sparse index for O(log n)
//!   lookup by log-index range. Appends are fsynced before they are
//!   acknowledged; the log can be truncated from either end.
//! - [`RangeSkipList`] caches the most recent records in a probabilistic
//!   skip list keyed by ranges `[start_id, end_id]`, bounded in size, with
//!   the newest ranges at the head.
//! - [`ConfStore`] composes the two: writes go to disk first, reads hit
//!   memory first and fall through, and startup warms the cache from the
//!   newest segment.
//!
//! Payloads are opaque [`bytes::Bytes`]; serialization belongs to the
//! caller. The store is single-writer, multi-reader within one process,
//! with blocking I/O throughout.
//!
//! ## Usage
//!
//! ```ignore
//! use bytes::Bytes;
//! use conflog::ConfStore;
//!
//! let store = ConfStore::open("./data", "CONF")?;
//!
//! store.push(123, Bytes::from(encoded_config))?;
//!
//! let current = store.last()?;
//! let at_100 = store.get(100)?;
//! let from_100 = store.list_after(100)?;
//!
//! store.truncate_before(100)?; // log compaction
//! store.truncate_after(200)?;  // log reconciliation
//! ```

pub mod config;
pub mod disk_log;
pub mod error;
pub mod record;
pub mod segment;
pub mod skiplist;
pub mod store;

pub use config::StoreConfig;
pub use disk_log::DiskLog;
pub use error::{Error, Result};
pub use record::{Record, BLOCK_SIZE, OPEN_END_ID, RECORD_HEADER_SIZE};
pub use skiplist::RangeSkipList;
pub use store::ConfStore;
