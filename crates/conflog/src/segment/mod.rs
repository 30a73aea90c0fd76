//! Segment Files
//!
//! A segment is one data file plus its sparse index file. The data file is
//! a plain concatenation of block-padded record slots (see
//! [`crate::record`]); the index file is described in [`index`]. Segments
//! are named after the `start_id` of their first record:
//!
//! ```text
//! <dir>/<prefix>_0000000001.data
//! <dir>/<prefix>_0000000001.idx
//! <dir>/<prefix>_0000003544.data
//! <dir>/<prefix>_0000003544.idx
//! ```
//!
//! The numeric part is zero-padded to ten digits so lexical and numeric
//! order agree. The segment with the largest embedded start id is the
//! active one.
//!
//! This module owns everything that touches a single segment: slot reads,
//! section scans driven by the sparse index, whole-file listings, and
//! index reconstruction from the data file (which also detects and cuts a
//! torn tail left by a crashed append).

mod index;

pub use index::{IndexEntry, SectionLimits, SegmentMeta, SparseIndex};

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::{
    decode_slot, is_open_end, padded_slot_len, Record, RECORD_HEADER_SIZE,
};

/// Open a new data file once the current one would grow past this size.
pub const MAX_DATA_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// A sparse-index section covers at most this much of the data file.
pub const MAX_SECTION_BYTES: u64 = 1024 * 1024;

/// A sparse-index section covers at most this many records.
pub const MAX_RECORDS_PER_SECTION: u64 = 1000;

/// Width of the zero-padded start id embedded in file names.
pub const FILENAME_DIGITS: usize = 10;

const DATA_FILE_SUFFIX: &str = ".data";

/// File name of the data file whose first record starts at `start_id`.
pub fn data_file_name(prefix: &str, start_id: u64) -> String {
    format!("{prefix}_{start_id:0width$}{DATA_FILE_SUFFIX}", width = FILENAME_DIGITS)
}

/// Sibling `.idx` path for a data file path.
pub fn index_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("idx")
}

/// Parse the start id out of a data file name; `None` for anything that is
/// not a `<prefix>_<10 digits>.data` file of this store.
pub fn parse_start_id(prefix: &str, file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(DATA_FILE_SUFFIX)?;
    if digits.len() != FILENAME_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// One data file and its sparse index.
pub struct Segment {
    data_path: PathBuf,
    index: SparseIndex,
}

impl Segment {
    /// Create a brand-new, empty segment (fresh data and index files).
    pub fn create(data_path: PathBuf, limits: SectionLimits) -> Result<Self> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        let index = SparseIndex::create(index_path(&data_path), limits)?;
        Ok(Self { data_path, index })
    }

    /// Open a segment, loading its index file or rebuilding it from the
    /// data file when the index is missing, stale, or corrupt.
    pub fn open(data_path: PathBuf, limits: SectionLimits) -> Result<Self> {
        let idx_path = index_path(&data_path);
        if idx_path.exists() {
            match SparseIndex::load(&idx_path, limits) {
                Ok(index) => {
                    // An index whose size disagrees with the data file is
                    // stale (crash between append and close).
                    let actual = std::fs::metadata(&data_path)?.len();
                    if index.meta().data_file_size == actual {
                        return Ok(Self { data_path, index });
                    }
                    warn!(
                        segment = %data_path.display(),
                        indexed = index.meta().data_file_size,
                        actual,
                        "index file is stale, rebuilding"
                    );
                }
                Err(err) => {
                    warn!(
                        segment = %data_path.display(),
                        error = %err,
                        "index file failed sanity checks, rebuilding"
                    );
                }
            }
        } else {
            debug!(segment = %data_path.display(), "index file missing, rebuilding");
        }
        Self::rebuild(data_path, limits)
    }

    /// Reconstruct the sparse index purely from the data file, re-emitting
    /// the `.idx` file. A trailing slot whose declared length runs past
    /// EOF is a torn write: the data file is cut back to the last
    /// well-formed record boundary.
    pub fn rebuild(data_path: PathBuf, limits: SectionLimits) -> Result<Self> {
        let raw = std::fs::read(&data_path)?;
        let mut index = SparseIndex::create(index_path(&data_path), limits)?;

        let mut pos = 0usize;
        let mut last_end_id = None;
        while let Some((record, consumed)) = decode_slot(&raw[pos..]) {
            index.record_appended(record.start_id, consumed as u64)?;
            last_end_id = Some(record.end_id);
            pos += consumed;
        }

        if pos < raw.len() {
            warn!(
                segment = %data_path.display(),
                valid = pos,
                total = raw.len(),
                "torn record at end of data file, truncating to last record boundary"
            );
            let file = OpenOptions::new().write(true).open(&data_path)?;
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }

        // A sealed segment's bound is its last record's patched end id; an
        // open sentinel (either form) leaves the segment unbounded above.
        if let Some(end_id) = last_end_id {
            if !is_open_end(end_id) {
                index.set_max_id(end_id);
            }
        }
        index.sync()?;

        debug!(
            segment = %data_path.display(),
            records = index.meta().record_count,
            sections = index.entries().len(),
            "sparse index rebuilt from data file"
        );
        Ok(Self { data_path, index })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn meta(&self) -> &SegmentMeta {
        self.index.meta()
    }

    pub fn index(&self) -> &SparseIndex {
        &self.index
    }

    pub(crate) fn index_mut(&mut self) -> &mut SparseIndex {
        &mut self.index
    }

    /// Find the record covering `log_index` and its byte offset, scanning
    /// only the section the sparse index points at.
    pub fn find_record(&self, log_index: u64) -> Result<(Record, u64)> {
        let (lo, hi) = self.index.locate(log_index)?;
        let section = self.read_range(lo, hi)?;

        let mut pos = 0usize;
        while let Some((record, consumed)) = decode_slot(&section[pos..]) {
            if record.covers(log_index) {
                return Ok((record, lo + pos as u64));
            }
            pos += consumed;
        }
        Err(Error::NotFound)
    }

    /// Every record in the segment, in start-id order.
    pub fn read_all(&self) -> Result<Vec<Record>> {
        let raw = std::fs::read(&self.data_path)?;
        let (records, consumed) = crate::record::decode_records(&raw);
        if consumed < raw.len() {
            warn!(
                segment = %self.data_path.display(),
                valid = consumed,
                total = raw.len(),
                "ignoring torn record at end of data file"
            );
        }
        Ok(records)
    }

    /// Records whose range reaches `log_index` or higher, using the index
    /// to skip sections that end below it.
    pub fn records_from(&self, log_index: u64) -> Result<Vec<Record>> {
        // Below the segment minimum the whole file qualifies.
        let lo = match self.index.locate(log_index) {
            Ok((lo, _)) => lo,
            Err(Error::NotFound) => 0,
            Err(err) => return Err(err),
        };
        let tail = self.read_range(lo, self.meta().data_file_size)?;
        let (records, _) = crate::record::decode_records(&tail);
        Ok(records
            .into_iter()
            .filter(|record| record.reaches(log_index))
            .collect())
    }

    /// Records overlapping `[start_id, end_id]` (inclusive on both ends; a
    /// record straddling `start_id` is included).
    pub fn records_overlapping(&self, start_id: u64, end_id: u64) -> Result<Vec<Record>> {
        let lo = match self.index.locate(start_id) {
            Ok((lo, _)) => lo,
            Err(Error::NotFound) => 0,
            Err(err) => return Err(err),
        };
        let hi = match self.index.locate(end_id) {
            Ok((_, hi)) => hi,
            Err(Error::NotFound) => self.meta().data_file_size,
            Err(err) => return Err(err),
        };

        let span = self.read_range(lo, hi)?;
        let (records, _) = crate::record::decode_records(&span);
        Ok(records
            .into_iter()
            .filter(|record| record.start_id <= end_id && record.reaches(start_id))
            .collect())
    }

    /// Flush the index header and fsync the index file.
    pub fn sync_index(&self) -> Result<()> {
        self.index.sync()
    }

    /// Delete both files, consuming the segment.
    pub fn remove_files(self) -> Result<()> {
        self.index.remove()?;
        std::fs::remove_file(&self.data_path)?;
        Ok(())
    }

    fn read_range(&self, lo: u64, hi: u64) -> Result<Vec<u8>> {
        debug_assert!(hi >= lo);
        let mut buf = vec![0u8; (hi - lo) as usize];
        if !buf.is_empty() {
            let file = File::open(&self.data_path)?;
            file.read_exact_at(&mut buf, lo)?;
        }
        Ok(buf)
    }
}

/// Read the single record slot at `offset` through an already-open handle.
pub(crate) fn read_record_at(file: &File, path: &Path, offset: u64) -> Result<Record> {
    let mut header = [0u8; RECORD_HEADER_SIZE as usize];
    file.read_exact_at(&mut header, offset)?;

    let payload_len = u64::from_be_bytes(header[16..24].try_into().expect("8-byte slice"));
    let mut slot = vec![0u8; padded_slot_len(payload_len) as usize];
    file.read_exact_at(&mut slot, offset)?;

    let (record, _) = decode_slot(&slot).ok_or_else(|| Error::CorruptSegment {
        path: path.to_path_buf(),
        detail: format!("unreadable record slot at offset {offset}"),
    })?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn limits() -> SectionLimits {
        SectionLimits {
            max_records: MAX_RECORDS_PER_SECTION,
            max_bytes: MAX_SECTION_BYTES,
        }
    }

    fn write_segment(dir: &Path, start_ids: &[u64]) -> PathBuf {
        let path = dir.join(data_file_name("C", start_ids[0]));
        let mut raw = Vec::new();
        for (i, &start_id) in start_ids.iter().enumerate() {
            let end_id = start_ids
                .get(i + 1)
                .map(|next| next - 1)
                .unwrap_or(crate::record::OPEN_END_ID);
            let record = Record {
                start_id,
                end_id,
                payload: Bytes::from(format!("payload-{start_id}")),
            };
            raw.extend_from_slice(&crate::record::encode_slot(&record));
        }
        std::fs::write(&path, raw).unwrap();
        path
    }

    #[test]
    fn file_names_embed_the_start_id() {
        assert_eq!(data_file_name("CONF", 1), "CONF_0000000001.data");
        assert_eq!(data_file_name("C", 35707), "C_0000035707.data");

        assert_eq!(parse_start_id("CONF", "CONF_0000000001.data"), Some(1));
        assert_eq!(parse_start_id("CONF", "CONF_0000035707.data"), Some(35707));
        assert_eq!(parse_start_id("CONF", "CONF_0000000001.idx"), None);
        assert_eq!(parse_start_id("CONF", "OTHER_0000000001.data"), None);
        assert_eq!(parse_start_id("CONF", "CONF_001.data"), None);
    }

    #[test]
    fn rebuild_indexes_every_record() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), &[100, 200, 300]);

        let segment = Segment::rebuild(path, limits()).unwrap();
        assert_eq!(segment.meta().record_count, 3);
        assert_eq!(segment.meta().min_id, 100);
        assert_eq!(segment.meta().max_id, crate::record::OPEN_END_ID);
        assert_eq!(segment.meta().last_record_offset, 2 * 512);

        let (record, offset) = segment.find_record(250).unwrap();
        assert_eq!(record.start_id, 200);
        assert_eq!(record.end_id, 299);
        assert_eq!(offset, 512);
    }

    #[test]
    fn rebuild_cuts_a_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), &[100, 200, 300]);

        // Simulate a crash mid-append: half a slot of garbage at the end.
        let mut raw = std::fs::read(&path).unwrap();
        let full = raw.len();
        raw.extend_from_slice(&400u64.to_be_bytes());
        raw.extend_from_slice(&crate::record::OPEN_END_ID.to_be_bytes());
        raw.extend_from_slice(&2000u64.to_be_bytes());
        raw.extend_from_slice(&[0xee; 100]);
        std::fs::write(&path, &raw).unwrap();

        let segment = Segment::rebuild(path.clone(), limits()).unwrap();
        assert_eq!(segment.meta().record_count, 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, full);
        // The torn record is gone; queries above it land on the open-ended
        // survivor.
        assert_eq!(segment.find_record(400).unwrap().0.start_id, 300);
    }

    #[test]
    fn open_falls_back_to_rebuild_on_stale_index() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), &[100, 200]);

        let segment = Segment::open(path.clone(), limits()).unwrap();
        assert_eq!(segment.meta().record_count, 2);
        drop(segment);

        // Grow the data file behind the index's back.
        let record = Record::open_ended(300, Bytes::from_static(b"late"));
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&crate::record::encode_slot(&record));
        std::fs::write(&path, raw).unwrap();

        let segment = Segment::open(path, limits()).unwrap();
        assert_eq!(segment.meta().record_count, 3);
        assert_eq!(segment.find_record(301).unwrap().0.start_id, 300);
    }

    #[test]
    fn listings_filter_by_range() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), &[100, 200, 300, 400]);
        let segment = Segment::rebuild(path, limits()).unwrap();

        let from = segment.records_from(250).unwrap();
        assert_eq!(
            from.iter().map(|r| r.start_id).collect::<Vec<_>>(),
            vec![200, 300, 400]
        );

        let overlap = segment.records_overlapping(150, 310).unwrap();
        assert_eq!(
            overlap.iter().map(|r| r.start_id).collect::<Vec<_>>(),
            vec![100, 200, 300]
        );

        let all = segment.read_all().unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn legacy_zero_end_id_is_treated_as_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(data_file_name("C", 500));

        let mut raw = Vec::new();
        raw.extend_from_slice(&crate::record::encode_slot(&Record {
            start_id: 500,
            end_id: 599,
            payload: Bytes::from_static(b"old"),
        }));
        // A legacy writer left the final record's end id zeroed.
        raw.extend_from_slice(&crate::record::encode_slot(&Record {
            start_id: 600,
            end_id: 0,
            payload: Bytes::from_static(b"tail"),
        }));
        std::fs::write(&path, raw).unwrap();

        let segment = Segment::rebuild(path, limits()).unwrap();
        assert_eq!(segment.meta().max_id, crate::record::OPEN_END_ID);

        let (record, _) = segment.find_record(10_000).unwrap();
        assert_eq!(record.start_id, 600);
    }
}
