//! Durable Segmented Log
//!
//! `DiskLog` owns a directory of segments and every on-disk invariant:
//! records are strictly ordered by `start_id` across segments, each record
//! is block-padded, the previous record's `end_id` is patched in place on
//! every append, data files roll over near 2 MiB, and both ends of the log
//! can be truncated.
//!
//! ## Write Path
//!
//! ```text
//! append(log_index, payload)
//!   1. read the last record's start_id from the active file  ── ordering
//!   2. patch the last record's end_id to log_index - 1        ── glue
//!   3. roll to a new segment if this slot would overflow      ── seal
//!   4. write the new slot at the end of the active file       ── data
//!   5. fsync the active file                                  ── durable
//!   6. extend the sparse index (append-only)                  ── lookup
//! ```
//!
//! The data write is fsynced before `append` returns; index writes are not,
//! because the index is rebuilt from the data file whenever it disagrees
//! with it.
//!
//! ## Read Path
//!
//! Point lookups pick the covering segment from an ordered map, ask its
//! sparse index for a byte range, and scan at most one section. Range
//! listings walk the segments in ascending order, reading whole files when
//! a segment lies inside the query range and index-bounded spans otherwise.
//!
//! ## Truncation
//!
//! `truncate_before` deletes fully-expired segments and rewrites the
//! straddling one under its new first id; `truncate_after` deletes
//! fully-newer segments and cuts the straddling file at the containing
//! record's slot boundary. Both refresh the active-segment pointer, which
//! otherwise goes stale the moment the newest file is deleted or renamed.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::record::{encode_slot, is_open_end, padded_slot_len, Record};
use crate::segment::{data_file_name, parse_start_id, read_record_at, SectionLimits, Segment};

/// Write handle for the newest segment, kept open across appends.
struct ActiveFile {
    /// Key of the active segment in the segment map.
    key: u64,
    file: File,
    path: PathBuf,
}

/// The on-disk tier: a directory of segment files ordered by start id.
pub struct DiskLog {
    dir: PathBuf,
    prefix: String,
    segment_max_bytes: u64,
    limits: SectionLimits,

    /// Segments keyed by the start id embedded in their file name.
    /// Iteration order is ascending, which every range walk relies on.
    segments: BTreeMap<u64, Segment>,

    active: Option<ActiveFile>,
}

impl DiskLog {
    /// Open (or create) the log directory, loading every segment and
    /// rebuilding any index file that is missing or fails sanity checks.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let limits = SectionLimits {
            max_records: config.section_max_records,
            max_bytes: config.section_max_bytes,
        };

        let mut segments = BTreeMap::new();
        for entry in std::fs::read_dir(&config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(start_id) = parse_start_id(&config.file_prefix, name) else {
                continue;
            };
            let segment = Segment::open(entry.path(), limits)?;
            segments.insert(start_id, segment);
        }

        let mut log = Self {
            dir: config.dir.clone(),
            prefix: config.file_prefix.clone(),
            segment_max_bytes: config.segment_max_bytes,
            limits,
            segments,
            active: None,
        };
        log.refresh_active()?;

        info!(
            dir = %log.dir.display(),
            segments = log.segments.len(),
            "configuration log opened"
        );
        Ok(log)
    }

    /// Append a record. `log_index` must exceed the previous record's
    /// start id; the previous record's `end_id` is patched to
    /// `log_index - 1` and both writes are durable before this returns.
    pub fn append(&mut self, log_index: u64, payload: Bytes) -> Result<()> {
        let slot_len = padded_slot_len(payload.len() as u64);

        // A closed handle set re-derives its active segment.
        if self.active.is_none() && !self.segments.is_empty() {
            self.refresh_active()?;
        }

        // Ordering check against the last record as persisted, then glue
        // its range shut.
        if let Some(active) = &self.active {
            let meta = *self.segment(active.key)?.meta();
            if meta.record_count > 0 {
                let mut buf = [0u8; 8];
                active.file.read_exact_at(&mut buf, meta.last_record_offset)?;
                let last_start = u64::from_be_bytes(buf);
                if log_index <= last_start {
                    return Err(Error::InvalidOrdering {
                        last: last_start,
                        pushed: log_index,
                    });
                }
                active
                    .file
                    .write_all_at(&(log_index - 1).to_be_bytes(), meta.last_record_offset + 8)?;
            }
        }

        // Roll over before the active file outgrows its cap.
        match self.active.as_ref().map(|active| active.key) {
            None => self.create_segment(log_index)?,
            Some(key) => {
                let meta = *self.segment(key)?.meta();
                if meta.data_file_size + slot_len > self.segment_max_bytes {
                    self.seal_active(log_index)?;
                    self.create_segment(log_index)?;
                }
            }
        }

        let active = self.active.as_ref().ok_or(Error::NotFound)?;
        let offset = self.segment(active.key)?.meta().data_file_size;
        let slot = encode_slot(&Record::open_ended(log_index, payload));
        active.file.write_all_at(&slot, offset)?;
        active.file.sync_data()?;

        let key = active.key;
        self.segment_mut(key)?
            .index_mut()
            .record_appended(log_index, slot_len)?;

        Ok(())
    }

    /// The record covering `log_index`, or `NotFound`.
    pub fn get(&self, log_index: u64) -> Result<Record> {
        let (_, segment) = self
            .segments
            .range(..=log_index)
            .next_back()
            .ok_or(Error::NotFound)?;
        if !segment.meta().covers(log_index) {
            return Err(Error::NotFound);
        }
        segment.find_record(log_index).map(|(record, _)| record)
    }

    /// The newest record, straight from the active file.
    pub fn last(&self) -> Result<Record> {
        let active = self.active.as_ref().ok_or(Error::NotFound)?;
        let meta = *self.segment(active.key)?.meta();
        if meta.record_count == 0 {
            return Err(Error::NotFound);
        }
        read_record_at(&active.file, &active.path, meta.last_record_offset)
    }

    /// Records overlapping `[start_id, end_id]`, ascending. Inclusive on
    /// both ends; a record straddling `start_id` is included.
    pub fn list_between(&self, start_id: u64, end_id: u64) -> Result<Vec<Record>> {
        let mut result = Vec::new();
        for segment in self.segments.values() {
            let meta = segment.meta();
            if meta.record_count == 0 || meta.min_id > end_id {
                continue;
            }
            let open = is_open_end(meta.max_id);
            if !open && meta.max_id < start_id {
                continue;
            }
            if meta.min_id >= start_id && !open && meta.max_id <= end_id {
                result.extend(segment.read_all()?);
            } else {
                result.extend(segment.records_overlapping(start_id, end_id)?);
            }
        }
        Ok(result)
    }

    /// Records whose range reaches `log_index` or higher, ascending.
    pub fn list_after(&self, log_index: u64) -> Result<Vec<Record>> {
        let mut result = Vec::new();
        for segment in self.segments.values() {
            let meta = segment.meta();
            if meta.record_count == 0 {
                continue;
            }
            if meta.min_id <= log_index {
                if meta.max_id >= log_index || is_open_end(meta.max_id) {
                    result.extend(segment.records_from(log_index)?);
                }
            } else {
                result.extend(segment.read_all()?);
            }
        }
        Ok(result)
    }

    /// Every record of the newest segment, used to warm the cache on open.
    pub fn list_of_latest_segment(&self) -> Result<Vec<Record>> {
        match &self.active {
            Some(active) => self.segment(active.key)?.read_all(),
            None => Ok(Vec::new()),
        }
    }

    /// Drop everything with `end_id < log_index`. The straddling segment
    /// is rewritten under its new first id, with the containing record's
    /// `start_id` bumped to `log_index`.
    pub fn truncate_before(&mut self, log_index: u64) -> Result<()> {
        let keys: Vec<u64> = self.segments.keys().copied().collect();
        for key in keys {
            let meta = *self.segment(key)?.meta();
            if meta.record_count == 0 {
                continue;
            }
            if !is_open_end(meta.max_id) && meta.max_id < log_index {
                self.remove_segment(key)?;
            } else if meta.min_id >= log_index {
                continue;
            } else {
                self.rewrite_segment_from(key, log_index)?;
            }
        }
        self.refresh_active()?;
        info!(log_index, "truncated log prefix");
        Ok(())
    }

    /// Drop everything with `start_id > log_index`. The straddling
    /// segment's file is cut at the containing record's slot boundary and
    /// that record's `end_id` is patched to `log_index`.
    pub fn truncate_after(&mut self, log_index: u64) -> Result<()> {
        let keys: Vec<u64> = self.segments.keys().copied().collect();
        for key in keys {
            let meta = *self.segment(key)?.meta();
            if meta.record_count == 0 {
                continue;
            }
            if meta.min_id > log_index {
                self.remove_segment(key)?;
            } else if !is_open_end(meta.max_id) && meta.max_id < log_index {
                continue;
            } else {
                self.cut_segment_after(key, log_index)?;
            }
        }
        self.refresh_active()?;
        info!(log_index, "truncated log suffix");
        Ok(())
    }

    /// Flush every index header. Called on close; also run best-effort on
    /// drop.
    pub fn close(&mut self) -> Result<()> {
        if let Some(active) = &self.active {
            active.file.sync_data()?;
        }
        for segment in self.segments.values() {
            segment.sync_index()?;
        }
        self.active = None;
        Ok(())
    }

    /// Ascending iterator over the live segments (inspection and tests).
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn segment(&self, key: u64) -> Result<&Segment> {
        self.segments.get(&key).ok_or(Error::NotFound)
    }

    fn segment_mut(&mut self, key: u64) -> Result<&mut Segment> {
        self.segments.get_mut(&key).ok_or(Error::NotFound)
    }

    /// Re-derive the active segment (largest start id) and reopen its
    /// write handle.
    fn refresh_active(&mut self) -> Result<()> {
        self.active = None;
        if let Some((&key, segment)) = self.segments.iter().next_back() {
            let path = segment.data_path().to_path_buf();
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            self.active = Some(ActiveFile { key, file, path });
        }
        Ok(())
    }

    /// Seal the active segment before rolling over: pin its upper bound
    /// and make the pending end patch durable.
    fn seal_active(&mut self, next_start: u64) -> Result<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        active.file.sync_data()?;
        let key = active.key;
        let segment = self.segment_mut(key)?;
        segment.index_mut().set_max_id(next_start - 1);
        segment.sync_index()?;
        debug!(segment = key, max_id = next_start - 1, "sealed segment");
        Ok(())
    }

    fn create_segment(&mut self, start_id: u64) -> Result<()> {
        let path = self.dir.join(data_file_name(&self.prefix, start_id));
        let segment = Segment::create(path.clone(), self.limits)?;
        self.segments.insert(start_id, segment);

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        self.active = Some(ActiveFile {
            key: start_id,
            file,
            path: path.clone(),
        });
        info!(segment = %path.display(), "opened new data file");
        Ok(())
    }

    fn remove_segment(&mut self, key: u64) -> Result<()> {
        if let Some(segment) = self.segments.remove(&key) {
            let path = segment.data_path().to_path_buf();
            segment.remove_files()?;
            debug!(segment = %path.display(), "removed segment");
        }
        Ok(())
    }

    /// `truncate_before` on the straddling segment: write a new data file
    /// named after `log_index` whose first slot is the containing record
    /// with its `start_id` bumped, followed by every later slot unchanged.
    fn rewrite_segment_from(&mut self, key: u64, log_index: u64) -> Result<()> {
        let segment = self.segment(key)?;
        let (record, offset) = segment.find_record(log_index)?;
        let old_raw = std::fs::read(segment.data_path())?;

        let mut patched = record.clone();
        patched.start_id = log_index;

        let tail_start = (offset + record.slot_len()) as usize;
        let mut new_raw = Vec::with_capacity(patched.slot_len() as usize + old_raw.len() - tail_start);
        new_raw.extend_from_slice(&encode_slot(&patched));
        new_raw.extend_from_slice(&old_raw[tail_start..]);

        let new_path = self.dir.join(data_file_name(&self.prefix, log_index));
        let new_file = File::create(&new_path)?;
        new_file.write_all_at(&new_raw, 0)?;
        new_file.sync_all()?;
        drop(new_file);

        self.remove_segment(key)?;
        let rebuilt = Segment::rebuild(new_path.clone(), self.limits)?;
        self.segments.insert(log_index, rebuilt);

        debug!(
            old_segment = key,
            new_segment = %new_path.display(),
            "rewrote straddling segment"
        );
        Ok(())
    }

    /// `truncate_after` on the straddling segment: cut the file at the end
    /// of the containing record's slot and patch its `end_id`.
    fn cut_segment_after(&mut self, key: u64, log_index: u64) -> Result<()> {
        let segment = self.segment(key)?;
        let (record, offset) = segment.find_record(log_index)?;
        let data_path = segment.data_path().to_path_buf();

        let file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        file.set_len(offset + record.slot_len())?;
        file.write_all_at(&log_index.to_be_bytes(), offset + 8)?;
        file.sync_all()?;
        drop(file);

        // Close the old index handle before the rebuild recreates the file.
        self.segments.remove(&key);
        let rebuilt = Segment::rebuild(data_path.clone(), self.limits)?;
        self.segments.insert(key, rebuilt);

        debug!(
            segment = %data_path.display(),
            end_id = log_index,
            "cut straddling segment"
        );
        Ok(())
    }
}

impl Drop for DiskLog {
    fn drop(&mut self) {
        for segment in self.segments.values() {
            if let Err(err) = segment.sync_index() {
                warn!(
                    segment = %segment.data_path().display(),
                    error = %err,
                    "failed to flush index on drop"
                );
            }
        }
    }
}
