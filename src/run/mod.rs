//! Immutable sorted run with an embedded ISAM-style directory.
//!
//! A run is the unit a level stores: a contiguous sorted record array, a
//! compact directory for range-bound lookup, a tombstone bloom filter, and
//! cumulative weight sums for O(1) range-weight queries. Runs are built from
//! a memtable's sorted output or from a k-way merge of older runs
//! (see [`merge`]); after construction the only legal in-place mutation is
//! setting a record's delete tag.
//!
//! Directory layout: every `ISAM_LEAF_FANOUT` consecutive records form one
//! leaf group whose separator is the group's maximum key; every
//! `ISAM_FANOUT` consecutive directory entries roll up into one entry of the
//! next level until a single root remains. Lookups descend the directory
//! choosing the first child whose separator covers the probe key, then scan
//! the leaf group forward.

mod merge;

use parking_lot::Mutex;
use rand::Rng;

use crate::alias::Alias;
use crate::bloom::{BloomFilter, BF_FPR, BF_HASH_FUNCS};
use crate::memtable::MemTable;
use crate::record::{Key, Record, Value, Weight};

/// Directory node byte budget; one node per cache-line pair.
pub const ISAM_NODE_SIZE: usize = 256;
/// Separator keys (plus child slots) per internal node.
pub const ISAM_FANOUT: usize =
    ISAM_NODE_SIZE / (std::mem::size_of::<Key>() + std::mem::size_of::<u32>());
/// Records per leaf group.
pub const ISAM_LEAF_FANOUT: usize = ISAM_NODE_SIZE / std::mem::size_of::<Record>();

/// Bottom-up separator directory. `levels[0]` holds one max-key separator
/// per leaf group; each higher level groups `ISAM_FANOUT` entries of the
/// level below. Child links are pure index arithmetic: entry `i` at level
/// `d` covers entries `[i * ISAM_FANOUT, (i + 1) * ISAM_FANOUT)` at `d - 1`.
#[derive(Debug, Clone, Default)]
struct IsamIndex {
    levels: Vec<Vec<Key>>,
}

impl IsamIndex {
    fn build(records: &[Record]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut leaf = Vec::with_capacity(records.len().div_ceil(ISAM_LEAF_FANOUT));
        for group in records.chunks(ISAM_LEAF_FANOUT) {
            leaf.push(group[group.len() - 1].key);
        }

        let mut levels = vec![leaf];
        while levels[levels.len() - 1].len() > 1 {
            let prev = &levels[levels.len() - 1];
            let next: Vec<Key> = prev
                .chunks(ISAM_FANOUT)
                .map(|chunk| chunk[chunk.len() - 1])
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// Returns the leaf-group index whose separator first covers `key`
    /// (`>=`, or `>` when `strict`). Keys beyond every separator land in the
    /// last group.
    fn descend(&self, key: Key, strict: bool) -> usize {
        let mut idx = 0usize;
        for depth in (0..self.levels.len().saturating_sub(1)).rev() {
            let level = &self.levels[depth];
            let base = idx * ISAM_FANOUT;
            let end = (base + ISAM_FANOUT).min(level.len());
            idx = end - 1;
            for (i, sep) in level[base..end].iter().enumerate() {
                if (strict && *sep > key) || (!strict && *sep >= key) {
                    idx = base + i;
                    break;
                }
            }
        }
        idx
    }

    fn memory_utilization(&self) -> usize {
        let entries: usize = self.levels.iter().map(Vec::len).sum();
        entries.div_ceil(ISAM_FANOUT) * ISAM_NODE_SIZE
    }
}

#[derive(Debug)]
struct CachedAlias {
    low: usize,
    high: usize,
    alias: Alias,
}

#[derive(Debug)]
pub struct Run {
    records: Vec<Record>,
    index: IsamIndex,
    filter: BloomFilter,
    weight_psum: Vec<f64>,
    tombstone_cnt: usize,
    deleted_cnt: usize,
    cancellations: usize,
    wirs_cache: Mutex<Option<CachedAlias>>,
}

impl Run {
    /// Builds a run from a memtable's sorted output. A live record directly
    /// followed by its matching tombstone cancels: both are dropped.
    /// Memtable slot bits are stripped from surviving headers.
    pub fn from_memtable(memtable: &MemTable, rng: &mut impl Rng) -> Self {
        let sorted = memtable.sorted_output();
        let mut out = Vec::with_capacity(sorted.len());
        let mut cancellations = 0usize;

        let mut i = 0;
        while i < sorted.len() {
            if !sorted[i].is_tombstone()
                && i + 1 < sorted.len()
                && sorted[i].matches(&sorted[i + 1])
                && sorted[i + 1].is_tombstone()
            {
                i += 2;
                cancellations += 1;
                continue;
            }
            let mut rec = sorted[i];
            rec.strip_slot();
            out.push(rec);
            i += 1;
        }

        Self::assemble(out, cancellations, rng)
    }

    /// Builds a run as the k-way merge of existing runs, cancelling matching
    /// live-record/tombstone pairs that meet in the merge heap.
    pub fn from_merge(inputs: &[&Run], rng: &mut impl Rng) -> Self {
        let slices: Vec<&[Record]> = inputs.iter().map(|run| run.records.as_slice()).collect();
        let (records, cancellations) = merge::merge_sorted(&slices);
        Self::assemble(records, cancellations, rng)
    }

    /// Rebuilds a run from records already in sorted order (metadata reload).
    pub(crate) fn from_sorted(records: Vec<Record>, rng: &mut impl Rng) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].order(&w[1]).is_le()));
        Self::assemble(records, 0, rng)
    }

    fn assemble(records: Vec<Record>, cancellations: usize, rng: &mut impl Rng) -> Self {
        let tombstone_cnt = records.iter().filter(|r| r.is_tombstone()).count();
        let deleted_cnt = records.iter().filter(|r| r.is_delete_tagged()).count();

        let mut filter = BloomFilter::new(BF_FPR, tombstone_cnt, BF_HASH_FUNCS, rng);
        for rec in records.iter().filter(|r| r.is_tombstone()) {
            filter.insert(rec.key);
        }

        let mut weight_psum = Vec::with_capacity(records.len() + 1);
        let mut acc = 0.0f64;
        weight_psum.push(acc);
        for rec in &records {
            acc += rec.weight;
            weight_psum.push(acc);
        }

        let index = IsamIndex::build(&records);
        Self {
            records,
            index,
            filter,
            weight_psum,
            tombstone_cnt,
            deleted_cnt,
            cancellations,
            wirs_cache: Mutex::new(None),
        }
    }

    /// Index of the first record with `key >= probe`.
    pub fn lower_bound(&self, key: Key) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        let mut pos = self.index.descend(key, false) * ISAM_LEAF_FANOUT;
        while pos < self.records.len() && self.records[pos].key < key {
            pos += 1;
        }
        pos
    }

    /// Index one past the last record with `key <= probe`.
    pub fn upper_bound(&self, key: Key) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        let mut pos = self.index.descend(key, true) * ISAM_LEAF_FANOUT;
        while pos < self.records.len() && self.records[pos].key <= key {
            pos += 1;
        }
        pos
    }

    pub fn record_at(&self, idx: usize) -> Option<&Record> {
        self.records.get(idx)
    }

    pub(crate) fn records(&self) -> &[Record] {
        &self.records
    }

    /// Bloom-gated probe for a tombstone matching `(key, value)`.
    pub fn check_tombstone(&self, key: Key, value: Value) -> bool {
        if !self.filter.lookup(key) {
            return false;
        }

        let mut idx = self.lower_bound(key);
        while idx < self.records.len() && self.records[idx].lt_kv(key, value) {
            idx += 1;
        }
        while idx < self.records.len() && self.records[idx].matches_kv(key, value) {
            if self.records[idx].is_tombstone() {
                return true;
            }
            idx += 1;
        }
        false
    }

    pub(crate) fn contains_live(&self, key: Key, value: Value) -> bool {
        let mut idx = self.lower_bound(key);
        while idx < self.records.len() && self.records[idx].lt_kv(key, value) {
            idx += 1;
        }
        while idx < self.records.len() && self.records[idx].matches_kv(key, value) {
            if !self.records[idx].is_tombstone() {
                return true;
            }
            idx += 1;
        }
        false
    }

    /// Tags the first live, untagged match in place. The tag is a
    /// single-word store; a concurrent sampler revalidates after its draw.
    pub fn delete_record(&mut self, key: Key, value: Value) -> bool {
        let mut idx = self.lower_bound(key);
        while idx < self.records.len() && self.records[idx].lt_kv(key, value) {
            idx += 1;
        }
        while idx < self.records.len() && self.records[idx].matches_kv(key, value) {
            let rec = &mut self.records[idx];
            if !rec.is_tombstone() && !rec.is_delete_tagged() {
                rec.set_delete_tag();
                self.deleted_cnt += 1;
                return true;
            }
            idx += 1;
        }
        false
    }

    /// Total weight over the record index range `[low, high)`.
    pub fn range_weight(&self, low: usize, high: usize) -> Weight {
        self.weight_psum[high] - self.weight_psum[low]
    }

    /// Weighted indexed range sample: draws `n` candidates from `[low, high)`
    /// proportionally to record weight, keeps those accepted by `validate`,
    /// and returns the accepted count. The per-segment alias is cached and
    /// reused while consecutive queries hit the same bounds.
    pub fn sample_weighted(
        &self,
        low: usize,
        high: usize,
        n: usize,
        rng: &mut impl Rng,
        mut validate: impl FnMut(&Record) -> bool,
        out: &mut Vec<Record>,
    ) -> usize {
        if low >= high {
            return 0;
        }

        let mut cache = self.wirs_cache.lock();
        let hit = matches!(&*cache, Some(c) if c.low == low && c.high == high);
        if !hit {
            if self.range_weight(low, high) <= 0.0 {
                return 0;
            }
            let weights: Vec<f64> = self.records[low..high].iter().map(|r| r.weight).collect();
            *cache = Some(CachedAlias {
                low,
                high,
                alias: Alias::new(&weights),
            });
        }
        let Some(cached) = cache.as_ref() else {
            return 0;
        };

        let mut accepted = 0;
        for _ in 0..n {
            let rec = self.records[low + cached.alias.draw(rng)];
            if validate(&rec) {
                out.push(rec);
                accepted += 1;
            }
        }
        accepted
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstone_cnt
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted_cnt
    }

    /// Live-record/tombstone pairs elided while building this run.
    pub fn cancellation_count(&self) -> usize {
        self.cancellations
    }

    pub fn total_weight(&self) -> Weight {
        self.weight_psum[self.records.len()]
    }

    pub fn memory_utilization(&self) -> usize {
        self.records.len() * std::mem::size_of::<Record>() + self.index.memory_utilization()
    }

    pub fn aux_memory_utilization(&self) -> usize {
        let cache = self
            .wirs_cache
            .lock()
            .as_ref()
            .map_or(0, |c| c.alias.memory_utilization());
        self.filter.memory_utilization() + cache
    }
}
