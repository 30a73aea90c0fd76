//! In-Memory Range Skip List
//!
//! The hot tier: a probabilistic skip list whose elements are log-index
//! ranges `[start_id, end_id]`, not points. Keys *decrease* from head to
//! tail — the head side holds the newest ranges, because pushes, `last()`
//! and near-latest lookups dominate the workload:
//!
//! ```text
//! [lvl 2] head ──────────────────────▶ (98,90) ───────────────────▶ tail
//! [lvl 1] head ──▶ (MAX,110) ────────▶ (98,90) ──▶ (15,12) ───────▶ tail
//! [lvl 0] head ──▶ (MAX,110) ──▶ (109,99) ──▶ (98,90) ──▶ ... ───▶ tail
//! ```
//!
//! Every lookup uses one primitive, the three-way comparison of a node
//! against a scalar: below (`end_id < id`), above (`start_id > id`), or
//! containing. Dropping through level 0 without a hit means the range is
//! not in memory and the caller falls through to disk.
//!
//! The list is bounded: once it holds `capacity` records, a push first
//! evicts the oldest `evict_batch` in one cut. The newest record is never
//! evicted, so the list always holds the most recent contiguous suffix of
//! the log.
//!
//! ## Representation
//!
//! Nodes live in a `Vec` arena and link to each other by index, with a
//! free list for reuse; `HEAD` and `TAIL` are sentinel slots bracketing
//! every level. Each node carries `MAX_LEVEL` forward slots but is linked
//! only up to its drawn level; traversal at a level only ever reaches
//! nodes linked at that level.
//!
//! ## Thread Safety
//!
//! Not internally synchronized. The composition layer wraps the list in a
//! `parking_lot::RwLock`: the single writer takes the write lock for
//! `push`/`truncate_*`, readers share the read lock.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::record::{is_open_end, Record, OPEN_END_ID};

/// Hard cap on forward pointers per node; levels are drawn in
/// `[0, MAX_LEVEL - 1]`.
pub const MAX_LEVEL: usize = 10;

/// Default bound on resident records.
pub const MAX_RECORDS_IN_MEM: usize = 1000;

/// Default number of oldest records dropped by one eviction.
pub const EVICT_BATCH: usize = 100;

/// Default cap on the size of one `list_after` result.
pub const MAX_RESULT_NUM: usize = 10_000;

const HEAD: usize = 0;
const TAIL: usize = 1;

/// Where a scalar log index sits relative to a node's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeCmp {
    /// The node's whole range is below the index (`end_id < id`).
    Below,
    /// The node's whole range is above the index (`start_id > id`).
    Above,
    /// The index falls inside the node's range.
    Contains,
}

fn range_cmp(record: &Record, log_index: u64) -> RangeCmp {
    if !is_open_end(record.end_id) && record.end_id < log_index {
        RangeCmp::Below
    } else if record.start_id > log_index {
        RangeCmp::Above
    } else {
        RangeCmp::Contains
    }
}

struct Node {
    /// `None` only for the two sentinels and free-listed slots.
    record: Option<Record>,
    next: [usize; MAX_LEVEL],
}

impl Node {
    fn empty() -> Self {
        Self {
            record: None,
            next: [TAIL; MAX_LEVEL],
        }
    }
}

/// Bounded, range-keyed skip list over the newest suffix of the log.
pub struct RangeSkipList {
    arena: Vec<Node>,
    free: Vec<usize>,
    len: usize,
    /// Highest level with at least one linked node, ever. Never shrinks.
    max_level: usize,
    rng: StdRng,
    capacity: usize,
    evict_batch: usize,
    result_cap: usize,
}

impl RangeSkipList {
    /// An empty list with explicit bounds (the store wires these from its
    /// config).
    pub fn new(capacity: usize, evict_batch: usize, result_cap: usize) -> Self {
        let mut arena = Vec::with_capacity(capacity.saturating_add(2));
        arena.push(Node::empty()); // HEAD
        arena.push(Node::empty()); // TAIL
        Self {
            arena,
            free: Vec::new(),
            len: 0,
            max_level: 0,
            rng: StdRng::from_entropy(),
            capacity,
            evict_batch,
            result_cap,
        }
    }

    /// Number of resident records.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push a strictly newer record at the head. Evicts the oldest
    /// `evict_batch` records first when the list is full.
    pub fn push(&mut self, record: Record) -> Result<()> {
        if self.len >= self.capacity {
            self.truncate_some(self.evict_batch);
        }

        if let Some(first) = self.first_record() {
            if record.start_id <= first.start_id {
                return Err(Error::NotLatest {
                    last: first.start_id,
                    pushed: record.start_id,
                });
            }
        }

        let start_id = record.start_id;
        let level = self.random_level();
        let node = self.alloc(record);
        for lv in 0..=level {
            self.arena[node].next[lv] = self.arena[HEAD].next[lv];
            self.arena[HEAD].next[lv] = node;
        }
        self.max_level = self.max_level.max(level);

        // Glue the former newest record shut.
        let succ = self.arena[node].next[0];
        if succ != TAIL {
            if let Some(prev) = &mut self.arena[succ].record {
                prev.end_id = start_id - 1;
            }
        }

        self.len += 1;
        Ok(())
    }

    /// The newest resident record.
    pub fn last(&self) -> Result<Record> {
        self.first_record().cloned().ok_or(Error::NotFound)
    }

    /// The record containing `log_index`, or `NotFound` when the range has
    /// already been evicted (or never cached).
    pub fn get(&self, log_index: u64) -> Result<Record> {
        let mut level = self.max_level;
        let mut node = HEAD;
        loop {
            let next = self.arena[node].next[level];
            let cmp = match &self.arena[next].record {
                Some(record) => range_cmp(record, log_index),
                None => RangeCmp::Below, // tail sentinel
            };
            match cmp {
                RangeCmp::Contains => {
                    return match &self.arena[next].record {
                        Some(record) => Ok(record.clone()),
                        None => Err(Error::NotFound),
                    };
                }
                RangeCmp::Above => node = next,
                RangeCmp::Below => {
                    if level == 0 {
                        return Err(Error::NotFound);
                    }
                    level -= 1;
                }
            }
        }
    }

    /// Every resident range reaching `log_index` or higher, ascending by
    /// `start_id`, capped at `result_cap` (keeping the newest).
    pub fn list_after(&self, log_index: u64) -> Vec<Record> {
        // Count pass at level 0, then a bounded fill pass.
        let mut count = 0usize;
        let mut node = self.arena[HEAD].next[0];
        while node != TAIL {
            match &self.arena[node].record {
                Some(record) if range_cmp(record, log_index) != RangeCmp::Below => count += 1,
                _ => break,
            }
            node = self.arena[node].next[0];
        }
        let count = count.min(self.result_cap);

        let mut result = Vec::with_capacity(count);
        let mut node = self.arena[HEAD].next[0];
        while result.len() < count {
            if node == TAIL {
                break;
            }
            if let Some(record) = &self.arena[node].record {
                result.push(record.clone());
            }
            node = self.arena[node].next[0];
        }
        result.reverse();
        result
    }

    /// Every resident record, ascending by `start_id`.
    pub fn list(&self) -> Vec<Record> {
        let mut result = Vec::with_capacity(self.len);
        let mut node = self.arena[HEAD].next[0];
        while node != TAIL {
            if let Some(record) = &self.arena[node].record {
                result.push(record.clone());
            }
            node = self.arena[node].next[0];
        }
        result.reverse();
        result
    }

    /// Drop every range entirely below `log_index`. A range containing it
    /// is trimmed (`start_id` bumped to `log_index`) and becomes the tail.
    pub fn truncate_before(&mut self, log_index: u64) {
        let mut survivors = 0usize;
        for lv in (0..=self.max_level).rev() {
            let mut node = HEAD;
            loop {
                let next = self.arena[node].next[lv];
                if next == TAIL {
                    break;
                }
                let cmp = match &self.arena[next].record {
                    Some(record) => range_cmp(record, log_index),
                    None => RangeCmp::Below,
                };
                match cmp {
                    RangeCmp::Above => {
                        if lv == 0 {
                            survivors += 1;
                        }
                        node = next;
                    }
                    RangeCmp::Contains => {
                        if lv == 0 {
                            survivors += 1;
                            if let Some(record) = &mut self.arena[next].record {
                                record.start_id = log_index;
                            }
                            let after = self.arena[next].next[0];
                            self.free_chain(after);
                        }
                        self.arena[next].next[lv] = TAIL;
                        break;
                    }
                    RangeCmp::Below => {
                        if lv == 0 {
                            self.free_chain(next);
                        }
                        self.arena[node].next[lv] = TAIL;
                        break;
                    }
                }
            }
        }
        self.len = survivors;
    }

    /// Drop every range starting above `log_index`. The surviving newest
    /// record (the one containing `log_index`, if any) is re-opened:
    /// its `end_id` goes back to the open sentinel. Returns it.
    pub fn truncate_after(&mut self, log_index: u64) -> Option<Record> {
        for lv in (0..=self.max_level).rev() {
            let mut next = self.arena[HEAD].next[lv];
            loop {
                if next == TAIL {
                    self.arena[HEAD].next[lv] = TAIL;
                    break;
                }
                let cmp = match &self.arena[next].record {
                    Some(record) => range_cmp(record, log_index),
                    None => RangeCmp::Below,
                };
                match cmp {
                    RangeCmp::Above => {
                        let following = self.arena[next].next[lv];
                        if lv == 0 {
                            self.len -= 1;
                            self.free_node(next);
                        }
                        next = following;
                    }
                    RangeCmp::Contains | RangeCmp::Below => {
                        self.arena[HEAD].next[lv] = next;
                        break;
                    }
                }
            }
        }

        let first = self.arena[HEAD].next[0];
        if first == TAIL {
            return None;
        }
        if let Some(record) = &mut self.arena[first].record {
            record.end_id = OPEN_END_ID;
        }
        self.arena[first].record.clone()
    }

    /// Cut the oldest `n` records in one pass. Empties the list when
    /// `n >= len`.
    pub fn truncate_some(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n >= self.len {
            let first = self.arena[HEAD].next[0];
            self.free_chain(first);
            for lv in 0..MAX_LEVEL {
                self.arena[HEAD].next[lv] = TAIL;
            }
            self.len = 0;
            return;
        }

        // Walk to the node that becomes the new oldest.
        let target = self.len - n;
        let mut node = self.arena[HEAD].next[0];
        let mut count = 1usize;
        while count < target {
            node = self.arena[node].next[0];
            count += 1;
        }
        let min_start = self.arena[node]
            .record
            .as_ref()
            .map(|record| record.start_id)
            .unwrap_or(0);

        let after = self.arena[node].next[0];
        self.free_chain(after);
        self.arena[node].next[0] = TAIL;

        // Higher levels: cut at the first pointer reaching below the new
        // oldest start id (freed slots compare as below).
        for lv in 1..=self.max_level {
            let mut node = HEAD;
            loop {
                let next = self.arena[node].next[lv];
                if next == TAIL {
                    break;
                }
                let keep = self.arena[next]
                    .record
                    .as_ref()
                    .is_some_and(|record| record.start_id >= min_start);
                if keep {
                    node = next;
                } else {
                    self.arena[node].next[lv] = TAIL;
                    break;
                }
            }
        }

        self.len = target;
    }

    fn first_record(&self) -> Option<&Record> {
        let first = self.arena[HEAD].next[0];
        if first == TAIL {
            None
        } else {
            self.arena[first].record.as_ref()
        }
    }

    /// Geometric level draw: each level is kept with probability 1/2,
    /// capped at `MAX_LEVEL - 1`.
    fn random_level(&mut self) -> usize {
        let mut level = 0;
        for i in 0..MAX_LEVEL {
            level = i;
            if self.rng.gen_bool(0.5) {
                break;
            }
        }
        level
    }

    fn alloc(&mut self, record: Record) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.arena[idx] = Node {
                    record: Some(record),
                    next: [TAIL; MAX_LEVEL],
                };
                idx
            }
            None => {
                self.arena.push(Node {
                    record: Some(record),
                    next: [TAIL; MAX_LEVEL],
                });
                self.arena.len() - 1
            }
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.arena[idx] = Node::empty();
        self.free.push(idx);
    }

    /// Free a level-0 suffix chain starting at `idx`.
    fn free_chain(&mut self, mut idx: usize) {
        while idx != TAIL {
            let next = self.arena[idx].next[0];
            self.free_node(idx);
            idx = next;
        }
    }
}

impl Default for RangeSkipList {
    fn default() -> Self {
        Self::new(MAX_RECORDS_IN_MEM, EVICT_BATCH, MAX_RESULT_NUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn push_ids(list: &mut RangeSkipList, ids: &[u64]) {
        for &id in ids {
            list.push(Record::open_ended(id, Bytes::from(format!("p{id}"))))
                .unwrap();
        }
    }

    #[test]
    fn push_glues_ranges_together() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[100, 200, 300]);

        let record = list.get(150).unwrap();
        assert_eq!((record.start_id, record.end_id), (100, 199));
        assert_eq!(record.payload.as_ref(), b"p100");

        let record = list.get(250).unwrap();
        assert_eq!((record.start_id, record.end_id), (200, 299));

        let record = list.get(300).unwrap();
        assert_eq!((record.start_id, record.end_id), (300, OPEN_END_ID));

        // The open head covers everything above it.
        assert_eq!(list.get(7_000_000).unwrap().start_id, 300);
        assert!(list.get(99).unwrap_err().is_not_found());

        assert_eq!(list.last().unwrap().start_id, 300);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn stale_push_is_rejected() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[100, 200]);

        let err = list
            .push(Record::open_ended(200, Bytes::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotLatest {
                last: 200,
                pushed: 200
            }
        ));
        let err = list
            .push(Record::open_ended(50, Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, Error::NotLatest { .. }));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn empty_list_reports_not_found() {
        let list = RangeSkipList::default();
        assert!(list.last().unwrap_err().is_not_found());
        assert!(list.get(1).unwrap_err().is_not_found());
        assert!(list.list_after(1).is_empty());
    }

    #[test]
    fn capacity_overflow_evicts_a_batch() {
        let mut list = RangeSkipList::default();
        for i in 0..1001u64 {
            list.push(Record::open_ended(1000 + i * 100, Bytes::new()))
                .unwrap();
        }

        // 1001 pushes, one eviction of 100 at the capacity boundary.
        assert_eq!(list.len(), 901);
        assert_eq!(list.last().unwrap().start_id, 1000 + 1000 * 100);

        // The oldest 100 are gone, the survivors are intact.
        assert!(list.get(1000).unwrap_err().is_not_found());
        assert!(list.get(1000 + 99 * 100).unwrap_err().is_not_found());
        assert_eq!(list.get(1000 + 100 * 100).unwrap().start_id, 11_000);
    }

    #[test]
    fn small_capacity_eviction_keeps_the_newest_suffix() {
        let mut list = RangeSkipList::new(10, 4, MAX_RESULT_NUM);
        push_ids(&mut list, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(list.len(), 10);

        push_ids(&mut list, &[11]);
        assert_eq!(list.len(), 7);

        let resident: Vec<u64> = list.list().iter().map(|r| r.start_id).collect();
        assert_eq!(resident, vec![5, 6, 7, 8, 9, 10, 11]);
        assert!(list.get(4).unwrap_err().is_not_found());
        assert_eq!(list.get(5).unwrap().start_id, 5);
    }

    #[test]
    fn list_after_is_ascending_and_capped() {
        let mut list = RangeSkipList::new(MAX_RECORDS_IN_MEM, EVICT_BATCH, 3);
        push_ids(&mut list, &[10, 20, 30, 40, 50]);

        // The straddling range [20, 29] reaches 25, so it is included.
        let full = list.list_after(25);
        let starts: Vec<u64> = full.iter().map(|r| r.start_id).collect();
        // Cap of 3 keeps the newest three, still ascending.
        assert_eq!(starts, vec![30, 40, 50]);

        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[10, 20, 30, 40, 50]);
        let starts: Vec<u64> = list.list_after(25).iter().map(|r| r.start_id).collect();
        assert_eq!(starts, vec![20, 30, 40, 50]);
        let starts: Vec<u64> = list.list_after(5).iter().map(|r| r.start_id).collect();
        assert_eq!(starts, vec![10, 20, 30, 40, 50]);
        assert!(list.list_after(51).len() == 1); // only the open head reaches
    }

    #[test]
    fn truncate_before_trims_the_straddler() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[10, 20, 30, 40]);

        list.truncate_before(25);
        assert_eq!(list.len(), 3);
        assert!(list.get(10).unwrap_err().is_not_found());
        assert!(list.get(24).unwrap_err().is_not_found());

        // The straddler is trimmed in place; everything above it survives.
        let record = list.get(25).unwrap();
        assert_eq!((record.start_id, record.end_id), (25, 29));
        assert_eq!(list.get(35).unwrap().start_id, 30);
        assert_eq!(list.last().unwrap().start_id, 40);

        let resident: Vec<u64> = list.list().iter().map(|r| r.start_id).collect();
        assert_eq!(resident, vec![25, 30, 40]);
    }

    #[test]
    fn truncate_before_everything_keeps_the_open_head() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[10, 20, 30]);

        // The open head contains any index above its start.
        list.truncate_before(1000);
        assert_eq!(list.len(), 1);
        let record = list.get(1000).unwrap();
        assert_eq!((record.start_id, record.end_id), (1000, OPEN_END_ID));
        assert!(list.get(999).unwrap_err().is_not_found());
    }

    #[test]
    fn truncate_after_reopens_the_survivor() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[10, 20, 30, 40]);

        let survivor = list.truncate_after(25).unwrap();
        assert_eq!(survivor.start_id, 20);
        assert_eq!(survivor.end_id, OPEN_END_ID);

        assert_eq!(list.len(), 2);
        assert_eq!(list.last().unwrap().start_id, 20);
        // Indices above the cut now resolve to the re-opened survivor.
        assert_eq!(list.get(35).unwrap().start_id, 20);
        assert_eq!(list.get(10).unwrap().start_id, 10);

        // Pushing resumes after the cut.
        list.push(Record::open_ended(26, Bytes::new())).unwrap();
        assert_eq!(list.last().unwrap().start_id, 26);
        assert_eq!(list.get(22).unwrap().end_id, 25);
    }

    #[test]
    fn truncate_after_below_everything_empties_the_list() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[10, 20, 30]);

        assert!(list.truncate_after(5).is_none());
        assert_eq!(list.len(), 0);
        assert!(list.last().unwrap_err().is_not_found());

        // A fresh push (any id) works on the emptied list.
        list.push(Record::open_ended(3, Bytes::new())).unwrap();
        assert_eq!(list.last().unwrap().start_id, 3);
    }

    #[test]
    fn truncate_some_cuts_exactly_the_oldest() {
        let mut list = RangeSkipList::default();
        push_ids(&mut list, &[10, 20, 30, 40, 50]);

        list.truncate_some(2);
        assert_eq!(list.len(), 3);
        let resident: Vec<u64> = list.list().iter().map(|r| r.start_id).collect();
        assert_eq!(resident, vec![30, 40, 50]);
        assert!(list.get(25).unwrap_err().is_not_found());

        list.truncate_some(99);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn arena_slots_are_reused_across_evictions() {
        let mut list = RangeSkipList::new(8, 2, MAX_RESULT_NUM);
        for i in 0..1000u64 {
            list.push(Record::open_ended(i + 1, Bytes::new())).unwrap();
        }
        assert!(list.len() <= 8);
        assert_eq!(list.last().unwrap().start_id, 1000);
        // Bounded resident set keeps the arena bounded too.
        assert!(list.arena.len() <= 2 + 8 + 2);
    }

    #[test]
    fn heavy_traffic_stays_consistent() {
        let mut list = RangeSkipList::new(64, 16, MAX_RESULT_NUM);
        let mut pushed = Vec::new();
        for i in 0..500u64 {
            let id = 10 + i * 3;
            list.push(Record::open_ended(id, Bytes::new())).unwrap();
            pushed.push(id);
        }

        // Whatever is resident must be the newest contiguous suffix.
        let resident = list.list();
        let n = resident.len();
        assert!(n <= 64);
        let expected_suffix: Vec<u64> = pushed[pushed.len() - n..].to_vec();
        let starts: Vec<u64> = resident.iter().map(|r| r.start_id).collect();
        assert_eq!(starts, expected_suffix);

        // Interior ranges are glued, the head is open.
        for pair in resident.windows(2) {
            assert_eq!(pair[0].end_id, pair[1].start_id - 1);
        }
        assert_eq!(resident[n - 1].end_id, OPEN_END_ID);

        // Every resident id resolves through the index structure.
        for record in &resident {
            assert_eq!(list.get(record.start_id).unwrap().start_id, record.start_id);
        }
    }
}
