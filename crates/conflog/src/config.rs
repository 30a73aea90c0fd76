//! Store Configuration
//!
//! `StoreConfig` carries the data directory, the file-name prefix shared by
//! every segment, and the tunable limits of both tiers. The defaults are
//! the wire-format constants; tests shrink them to force segment rollover
//! and cache eviction with small data sets.
//!
//! ## Usage
//!
//! ```ignore
//! use conflog::StoreConfig;
//!
//! // Production: defaults everywhere.
//! let config = StoreConfig::new("/var/lib/consensus/conf", "CONF");
//!
//! // Tests: tiny segments roll over after a few records.
//! let config = StoreConfig {
//!     segment_max_bytes: 8 * 1024,
//!     cache_max_records: 50,
//!     ..StoreConfig::new(dir.path(), "C")
//! };
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding every `<prefix>_<start id>.data` / `.idx` pair.
    pub dir: PathBuf,

    /// File-name prefix; distinct stores must use disjoint directories.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Roll the active segment once the next record would push its data
    /// file past this size (default: 2 MiB).
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// A sparse-index section covers at most this many data bytes
    /// (default: 1 MiB).
    #[serde(default = "default_section_max_bytes")]
    pub section_max_bytes: u64,

    /// A sparse-index section covers at most this many records
    /// (default: 1000).
    #[serde(default = "default_section_max_records")]
    pub section_max_records: u64,

    /// Upper bound on records held by the in-memory tier (default: 1000).
    #[serde(default = "default_cache_max_records")]
    pub cache_max_records: usize,

    /// How many of the oldest cached records one eviction drops
    /// (default: 100).
    #[serde(default = "default_cache_evict_batch")]
    pub cache_evict_batch: usize,

    /// Cap on the number of records a cache range listing returns
    /// (default: 10000).
    #[serde(default = "default_list_result_cap")]
    pub list_result_cap: usize,
}

impl StoreConfig {
    /// Config with the given directory and prefix, defaults elsewhere.
    pub fn new(dir: impl AsRef<Path>, file_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_prefix: file_prefix.into(),
            ..Self::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./conflog_data"),
            file_prefix: default_file_prefix(),
            segment_max_bytes: default_segment_max_bytes(),
            section_max_bytes: default_section_max_bytes(),
            section_max_records: default_section_max_records(),
            cache_max_records: default_cache_max_records(),
            cache_evict_batch: default_cache_evict_batch(),
            list_result_cap: default_list_result_cap(),
        }
    }
}

fn default_file_prefix() -> String {
    "CONF".to_string()
}

fn default_segment_max_bytes() -> u64 {
    2 * 1024 * 1024 // 2 MiB
}

fn default_section_max_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_section_max_records() -> u64 {
    1000
}

fn default_cache_max_records() -> usize {
    1000
}

fn default_cache_evict_batch() -> usize {
    100
}

fn default_list_result_cap() -> usize {
    10_000
}
