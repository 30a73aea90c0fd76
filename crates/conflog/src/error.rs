//! Error Types
//!
//! All operations in this crate return `Result<T>`, aliased to
//! `Result<T, Error>`, so failures propagate cleanly with `?`.
//!
//! ## Error Categories
//!
//! ### Lookup Misses
//! - `NotFound`: no record covers the queried log index. This is a normal
//!   result, not a failure — callers match on it to fall through from the
//!   in-memory tier to disk, or to report "no such configuration" cleanly.
//!
//! ### Precondition Violations
//! - `InvalidOrdering`: an append whose log index does not increase. Log
//!   indices are assigned by the consensus layer and must grow strictly, so
//!   this is a caller bug and is surfaced as-is.
//! - `NotLatest`: the in-memory tier only accepts pushes newer than its
//!   current head.
//!
//! ### Corruption
//! - `CorruptSegment`: an index file failed its sanity checks, or a data
//!   record's declared length exceeds the remaining file size. Index
//!   corruption is recoverable (the index is rebuilt from the data file);
//!   data corruption truncates at the last well-formed record boundary.
//!
//! ### I/O
//! - `Io`: any underlying filesystem error, with the source attached.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record not found")]
    NotFound,

    #[error("append out of order: log index {pushed} must exceed the last start id {last}")]
    InvalidOrdering { last: u64, pushed: u64 },

    #[error("pushed record {pushed} is not newer than the cached head {last}")]
    NotLatest { last: u64, pushed: u64 },

    #[error("corrupt segment {}: {detail}", .path.display())]
    CorruptSegment { path: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for lookup misses, which callers treat as a normal result
    /// rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable_from_io() {
        let miss = Error::NotFound;
        assert!(miss.is_not_found());

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!io.is_not_found());
    }
}
