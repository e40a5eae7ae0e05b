//! Bounded in-memory write buffers feeding level 0.
//!
//! Two implementations sit behind the `MemTable` enum, chosen at tree
//! construction:
//!
//! - [`BufferMemTable`]: an append-order array with an atomic tail counter.
//!   Uniform sampling draws directly from the append region and rejects
//!   out-of-range candidates, so inserts never pay a sort.
//! - [`TreeMemTable`]: a skip list keyed by `(key, value, header)` that keeps
//!   records incrementally sorted and aggregates record weight, supporting
//!   the weighted variant's filtered-vector range sampling.
//!
//! Both variants carry a tombstone bloom filter sized to the tombstone
//! capacity and follow the Active -> Flushing -> Retired state machine; a
//! truncate returns a retired table to Active.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rayon::prelude::*;

use crate::alias::Alias;
use crate::bloom::{BloomFilter, BF_FPR, BF_HASH_FUNCS};
use crate::record::{Key, Record, Value, Weight};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AppendError {
    #[error("memtable full")]
    Full,
    #[error("memtable tombstone capacity exhausted")]
    TombstoneFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableState {
    Active,
    Flushing,
    Retired,
}

impl MemTableState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Flushing,
            _ => Self::Retired,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Flushing => 1,
            Self::Retired => 2,
        }
    }
}

#[derive(Debug)]
pub enum MemTable {
    Buffer(BufferMemTable),
    Tree(TreeMemTable),
}

impl MemTable {
    pub fn buffer(capacity: usize, tombstone_capacity: usize, rng: &mut impl Rng) -> Self {
        Self::Buffer(BufferMemTable::new(capacity, tombstone_capacity, rng))
    }

    pub fn tree(capacity: usize, tombstone_capacity: usize, rng: &mut impl Rng) -> Self {
        Self::Tree(TreeMemTable::new(capacity, tombstone_capacity, rng))
    }

    pub fn append(
        &self,
        key: Key,
        value: Value,
        weight: Weight,
        tombstone: bool,
    ) -> Result<(), AppendError> {
        match self {
            Self::Buffer(mt) => mt.append(key, value, weight, tombstone),
            Self::Tree(mt) => mt.append(key, value, weight, tombstone),
        }
    }

    /// Resets counters and the tombstone filter. Only legal once the flush
    /// that retired this table has committed; the write lock taken here
    /// excludes any reader still pinning the buffer.
    pub fn truncate(&self) {
        match self {
            Self::Buffer(mt) => mt.truncate(),
            Self::Tree(mt) => mt.truncate(),
        }
        self.set_state(MemTableState::Active);
    }

    pub fn check_tombstone(&self, key: Key, value: Value) -> bool {
        match self {
            Self::Buffer(mt) => mt.check_tombstone(key, value),
            Self::Tree(mt) => mt.check_tombstone(key, value),
        }
    }

    /// Records in `(key, value, header)` order, ready for a run build.
    pub fn sorted_output(&self) -> Vec<Record> {
        match self {
            Self::Buffer(mt) => mt.sorted_output(),
            Self::Tree(mt) => mt.sorted_output(),
        }
    }

    /// In-range records in sorted order, tombstones included (the sampler
    /// rejects them after the draw).
    pub fn sampling_vector(&self, lo: Key, hi: Key) -> Vec<Record> {
        match self {
            Self::Buffer(mt) => mt.sampling_vector(lo, hi),
            Self::Tree(mt) => mt.sampling_vector(lo, hi),
        }
    }

    /// Indexed access into the append region; `None` past the visible count.
    pub fn record_at(&self, idx: usize) -> Option<Record> {
        match self {
            Self::Buffer(mt) => mt.record_at(idx),
            Self::Tree(_) => None,
        }
    }

    /// Sets the delete tag on the newest live record matching `(key, value)`.
    pub fn delete_record(&self, key: Key, value: Value) -> bool {
        match self {
            Self::Buffer(mt) => mt.delete_record(key, value),
            Self::Tree(mt) => mt.delete_record(key, value),
        }
    }

    pub fn record_count(&self) -> usize {
        match self {
            Self::Buffer(mt) => mt.reccnt.load(Ordering::Acquire),
            Self::Tree(mt) => mt.reccnt.load(Ordering::Acquire),
        }
    }

    pub fn tombstone_count(&self) -> usize {
        match self {
            Self::Buffer(mt) => mt.tombstonecnt.load(Ordering::Acquire),
            Self::Tree(mt) => mt.tombstonecnt.load(Ordering::Acquire),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Self::Buffer(mt) => mt.capacity,
            Self::Tree(mt) => mt.capacity,
        }
    }

    pub fn tombstone_capacity(&self) -> usize {
        match self {
            Self::Buffer(mt) => mt.tombstone_capacity,
            Self::Tree(mt) => mt.tombstone_capacity,
        }
    }

    pub fn is_full(&self) -> bool {
        self.record_count() >= self.capacity()
    }

    pub fn total_weight(&self) -> Weight {
        match self {
            Self::Buffer(mt) => {
                let records = mt.records.read();
                records[..mt.reccnt.load(Ordering::Acquire)]
                    .iter()
                    .map(|r| r.weight)
                    .sum()
            }
            Self::Tree(mt) => mt.total_weight(),
        }
    }

    pub fn state(&self) -> MemTableState {
        let cell = match self {
            Self::Buffer(mt) => &mt.state,
            Self::Tree(mt) => &mt.state,
        };
        MemTableState::from_u8(cell.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: MemTableState) {
        let cell = match self {
            Self::Buffer(mt) => &mt.state,
            Self::Tree(mt) => &mt.state,
        };
        cell.store(state.as_u8(), Ordering::Release);
    }

    pub fn memory_utilization(&self) -> usize {
        match self {
            Self::Buffer(mt) => mt.capacity * std::mem::size_of::<Record>(),
            Self::Tree(mt) => mt.reccnt.load(Ordering::Acquire) * std::mem::size_of::<Record>(),
        }
    }

    pub fn aux_memory_utilization(&self) -> usize {
        match self {
            Self::Buffer(mt) => mt.filter.lock().memory_utilization(),
            Self::Tree(mt) => mt.filter.lock().memory_utilization(),
        }
    }
}

/// Append-order buffer with an atomic tail for slot reservation.
///
/// The slot is claimed with a `fetch_add` and the record written before the
/// visible count advances, so readers never observe an unfinalized slot.
#[derive(Debug)]
pub struct BufferMemTable {
    capacity: usize,
    tombstone_capacity: usize,
    records: RwLock<Vec<Record>>,
    tail: AtomicUsize,
    reccnt: AtomicUsize,
    tombstonecnt: AtomicUsize,
    filter: Mutex<BloomFilter>,
    state: AtomicU8,
}

impl BufferMemTable {
    fn new(capacity: usize, tombstone_capacity: usize, rng: &mut impl Rng) -> Self {
        Self {
            capacity,
            tombstone_capacity,
            records: RwLock::new(vec![Record::default(); capacity]),
            tail: AtomicUsize::new(0),
            reccnt: AtomicUsize::new(0),
            tombstonecnt: AtomicUsize::new(0),
            filter: Mutex::new(BloomFilter::new(
                BF_FPR,
                tombstone_capacity,
                BF_HASH_FUNCS,
                rng,
            )),
            state: AtomicU8::new(MemTableState::Active.as_u8()),
        }
    }

    fn append(
        &self,
        key: Key,
        value: Value,
        weight: Weight,
        tombstone: bool,
    ) -> Result<(), AppendError> {
        if tombstone && self.tombstonecnt.load(Ordering::Acquire) + 1 > self.tombstone_capacity {
            return Err(AppendError::TombstoneFull);
        }

        let slot = self.tail.fetch_add(1, Ordering::AcqRel);
        if slot >= self.capacity {
            return Err(AppendError::Full);
        }

        let rec = if tombstone {
            Record::tombstone(key, value).with_slot(slot)
        } else {
            Record::new(key, value, weight).with_slot(slot)
        };
        self.records.write()[slot] = rec;

        if tombstone {
            self.tombstonecnt.fetch_add(1, Ordering::AcqRel);
            self.filter.lock().insert(key);
        }
        self.reccnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn truncate(&self) {
        let _guard = self.records.write();
        self.tail.store(0, Ordering::Release);
        self.reccnt.store(0, Ordering::Release);
        self.tombstonecnt.store(0, Ordering::Release);
        self.filter.lock().clear();
    }

    fn check_tombstone(&self, key: Key, value: Value) -> bool {
        if !self.filter.lock().lookup(key) {
            return false;
        }

        let records = self.records.read();
        records[..self.reccnt.load(Ordering::Acquire)]
            .iter()
            .any(|r| r.is_tombstone() && r.matches_kv(key, value))
    }

    fn sorted_output(&self) -> Vec<Record> {
        let records = self.records.read();
        let mut out = records[..self.reccnt.load(Ordering::Acquire)].to_vec();
        out.par_sort_unstable_by(Record::order);
        out
    }

    fn sampling_vector(&self, lo: Key, hi: Key) -> Vec<Record> {
        let records = self.records.read();
        let mut out: Vec<Record> = records[..self.reccnt.load(Ordering::Acquire)]
            .iter()
            .filter(|r| r.key >= lo && r.key <= hi)
            .copied()
            .collect();
        out.sort_unstable_by(Record::order);
        out
    }

    fn record_at(&self, idx: usize) -> Option<Record> {
        if idx >= self.reccnt.load(Ordering::Acquire) {
            return None;
        }
        Some(self.records.read()[idx])
    }

    fn delete_record(&self, key: Key, value: Value) -> bool {
        let mut records = self.records.write();
        let count = self.reccnt.load(Ordering::Acquire);
        for rec in records[..count].iter_mut().rev() {
            if rec.matches_kv(key, value) && !rec.is_tombstone() && !rec.is_delete_tagged() {
                rec.set_delete_tag();
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TreeKey {
    key: Key,
    value: Value,
    header: u32,
}

/// Skip-list memtable for the weighted variant. Entries stay sorted by
/// `(key, value, header)`; the header slot keeps duplicate pairs distinct.
#[derive(Debug)]
pub struct TreeMemTable {
    capacity: usize,
    tombstone_capacity: usize,
    map: SkipMap<TreeKey, Weight>,
    reccnt: AtomicUsize,
    tombstonecnt: AtomicUsize,
    weight: AtomicU64,
    max_weight: AtomicU64,
    filter: Mutex<BloomFilter>,
    state: AtomicU8,
}

impl TreeMemTable {
    fn new(capacity: usize, tombstone_capacity: usize, rng: &mut impl Rng) -> Self {
        Self {
            capacity,
            tombstone_capacity,
            map: SkipMap::new(),
            reccnt: AtomicUsize::new(0),
            tombstonecnt: AtomicUsize::new(0),
            weight: AtomicU64::new(0.0f64.to_bits()),
            max_weight: AtomicU64::new(0.0f64.to_bits()),
            filter: Mutex::new(BloomFilter::new(
                BF_FPR,
                tombstone_capacity,
                BF_HASH_FUNCS,
                rng,
            )),
            state: AtomicU8::new(MemTableState::Active.as_u8()),
        }
    }

    fn append(
        &self,
        key: Key,
        value: Value,
        weight: Weight,
        tombstone: bool,
    ) -> Result<(), AppendError> {
        let slot = self.reccnt.load(Ordering::Acquire);
        if slot >= self.capacity {
            return Err(AppendError::Full);
        }
        if tombstone && self.tombstonecnt.load(Ordering::Acquire) + 1 > self.tombstone_capacity {
            return Err(AppendError::TombstoneFull);
        }

        let rec = if tombstone {
            Record::tombstone(key, value).with_slot(slot)
        } else {
            Record::new(key, value, weight).with_slot(slot)
        };
        self.map.insert(
            TreeKey {
                key,
                value,
                header: rec.header,
            },
            rec.weight,
        );

        if tombstone {
            self.tombstonecnt.fetch_add(1, Ordering::AcqRel);
            self.filter.lock().insert(key);
        }
        self.reccnt.fetch_add(1, Ordering::AcqRel);

        atomic_f64_add(&self.weight, rec.weight);
        atomic_f64_max(&self.max_weight, rec.weight);
        Ok(())
    }

    fn truncate(&self) {
        while self.map.pop_front().is_some() {}
        self.reccnt.store(0, Ordering::Release);
        self.tombstonecnt.store(0, Ordering::Release);
        self.weight.store(0.0f64.to_bits(), Ordering::Release);
        self.max_weight.store(0.0f64.to_bits(), Ordering::Release);
        self.filter.lock().clear();
    }

    fn check_tombstone(&self, key: Key, value: Value) -> bool {
        if !self.filter.lock().lookup(key) {
            return false;
        }

        let lo = TreeKey {
            key,
            value,
            header: 0,
        };
        let hi = TreeKey {
            key,
            value,
            header: u32::MAX,
        };
        self.map
            .range(lo..=hi)
            .any(|entry| entry.key().header & 0x1 != 0)
    }

    fn sorted_output(&self) -> Vec<Record> {
        self.map
            .iter()
            .map(|entry| {
                let k = entry.key();
                Record {
                    key: k.key,
                    value: k.value,
                    weight: *entry.value(),
                    header: k.header,
                }
            })
            .collect()
    }

    fn sampling_vector(&self, lo: Key, hi: Key) -> Vec<Record> {
        let start = TreeKey {
            key: lo,
            value: 0,
            header: 0,
        };
        let end = TreeKey {
            key: hi,
            value: Value::MAX,
            header: u32::MAX,
        };
        self.map
            .range(start..=end)
            .map(|entry| {
                let k = entry.key();
                Record {
                    key: k.key,
                    value: k.value,
                    weight: *entry.value(),
                    header: k.header,
                }
            })
            .collect()
    }

    fn delete_record(&self, key: Key, value: Value) -> bool {
        let lo = TreeKey {
            key,
            value,
            header: 0,
        };
        let hi = TreeKey {
            key,
            value,
            header: u32::MAX,
        };
        let target = self
            .map
            .range(lo..=hi)
            .find(|entry| entry.key().header & 0x3 == 0)
            .map(|entry| (*entry.key(), *entry.value()));

        match target {
            Some((mut tree_key, weight)) => {
                self.map.remove(&tree_key);
                tree_key.header |= 0x2;
                self.map.insert(tree_key, weight);
                true
            }
            None => false,
        }
    }

    pub fn total_weight(&self) -> Weight {
        f64::from_bits(self.weight.load(Ordering::Acquire))
    }

    /// Largest single record weight seen since the last truncate; the upper
    /// envelope for rejection-based weighted draws over the raw buffer.
    pub fn max_weight(&self) -> Weight {
        f64::from_bits(self.max_weight.load(Ordering::Acquire))
    }

    /// Weighted draw of `k` records from the interval, with replacement.
    pub fn sample(&self, lo: Key, hi: Key, k: usize, rng: &mut impl Rng) -> Vec<Record> {
        let records = self.sampling_vector(lo, hi);
        let weights: Vec<f64> = records.iter().map(|r| r.weight).collect();
        if weights.iter().sum::<f64>() <= 0.0 {
            return Vec::new();
        }
        let alias = Alias::new(&weights);
        (0..k).map(|_| records[alias.draw(rng)]).collect()
    }
}

fn atomic_f64_add(cell: &AtomicU64, delta: f64) {
    let mut cur = cell.load(Ordering::Acquire);
    loop {
        let next = (f64::from_bits(cur) + delta).to_bits();
        match cell.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => cur = observed,
        }
    }
}

fn atomic_f64_max(cell: &AtomicU64, candidate: f64) {
    let mut cur = cell.load(Ordering::Acquire);
    while f64::from_bits(cur) < candidate {
        match cell.compare_exchange_weak(
            cur,
            candidate.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(observed) => cur = observed,
        }
    }
}
