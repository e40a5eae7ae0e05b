//! The LSM controller: memtables, the level vector, compaction, and the
//! range-sampling orchestration.
//!
//! Write path: appends land in the active memtable; a full memtable is built
//! into a level-0 run after a `merge_down` cascade makes room, and tombstone
//! maxima are enforced up the stack. Compactions complete before the
//! triggering call returns, so a sampler holding `&self` always observes a
//! settled level vector.
//!
//! Sample path: collect one descriptor per overlapping run (the memtable is
//! descriptor 0), build an alias across descriptor masses, then draw and
//! validate candidates, refilling rejected draws, until `k` samples are
//! accepted or the interval proves empty.
//!
//! Mutating operations take `&mut self`; sampling takes `&self`. The single
//! writer the engine assumes is thereby enforced by the borrow checker.

mod options;

use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::alias::Alias;
use crate::level::Level;
use crate::memtable::{AppendError, MemTable, MemTableState};
use crate::meta::{self, TREE_META_FILE};
use crate::record::{Key, Record, Value, Weight};
use crate::run::Run;
use crate::sampling::{SampleRange, SampleSource, SampleStats};

pub use options::{CompactionPolicy, DeletePolicy, LsmOptions, MemtableSampling, SamplingMode};

pub struct LsmTree {
    dir: PathBuf,
    options: LsmOptions,
    memtables: [MemTable; 2],
    active: usize,
    levels: Vec<Level>,
    // Structural randomness (bloom seeds) is reseeded from the caller's
    // generator at construction, so behavior stays reproducible without
    // threading an RNG through every append.
    filter_rng: SmallRng,
}

impl LsmTree {
    /// Opens a tree rooted at `dir`, reloading persisted levels when a
    /// `lsmtree.dat` is present.
    pub fn open(
        dir: impl AsRef<Path>,
        options: LsmOptions,
        rng: &mut impl Rng,
    ) -> anyhow::Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("create tree dir {dir:?}"))?;

        let mut filter_rng = SmallRng::seed_from_u64(rng.gen());
        let memtables = [
            Self::make_memtable(&options, &mut filter_rng),
            Self::make_memtable(&options, &mut filter_rng),
        ];

        let levels = if dir.join(TREE_META_FILE).exists() {
            meta::load(&dir, options.run_capacity(), &mut filter_rng)
                .context("load tree metadata")?
        } else {
            Vec::new()
        };

        Ok(Self {
            dir,
            options,
            memtables,
            active: 0,
            levels,
            filter_rng,
        })
    }

    fn make_memtable(options: &LsmOptions, rng: &mut impl Rng) -> MemTable {
        match options.sampling {
            SamplingMode::Uniform => MemTable::buffer(
                options.memtable_capacity,
                options.memtable_tombstone_capacity,
                rng,
            ),
            SamplingMode::Weighted => MemTable::tree(
                options.memtable_capacity,
                options.memtable_tombstone_capacity,
                rng,
            ),
        }
    }

    /// Appends a record (or tombstone). Returns `Ok(false)` when the
    /// memtable's tombstone capacity refused the append; a full memtable is
    /// flushed transparently.
    pub fn append(
        &mut self,
        key: Key,
        value: Value,
        weight: Weight,
        tombstone: bool,
    ) -> anyhow::Result<bool> {
        self.settle_rejection_debt()?;

        if self.active_memtable().is_full() {
            self.flush_memtable()?;
        }

        match self.active_memtable().append(key, value, weight, tombstone) {
            Ok(()) => Ok(true),
            Err(AppendError::TombstoneFull) => Ok(false),
            Err(AppendError::Full) => {
                self.flush_memtable()?;
                match self.active_memtable().append(key, value, weight, tombstone) {
                    Ok(()) => Ok(true),
                    Err(AppendError::TombstoneFull) => Ok(false),
                    Err(AppendError::Full) => bail!("memtable still full after flush"),
                }
            }
        }
    }

    /// Deletes `(key, value)`. Tagged policy walks the levels top-down and
    /// tags the first match in place, falling back to a tombstone append;
    /// tombstone policy always appends a tombstone.
    pub fn delete(&mut self, key: Key, value: Value) -> anyhow::Result<bool> {
        if self.options.delete_policy == DeletePolicy::Tagged {
            for level in &mut self.levels {
                if level.delete_record(key, value) {
                    return Ok(true);
                }
            }
            // The memtable scan is the most expensive probe and the least
            // likely to hit, so it goes last.
            if self.active_memtable().delete_record(key, value) {
                return Ok(true);
            }
        }
        self.append(key, value, 0.0, true)
    }

    /// Draws `k` records from `[lo, hi]`, uniformly or weighted per the
    /// tree's sampling mode. Accepted records are pushed into `out`; the
    /// returned statistics count every rejected candidate. When the interval
    /// holds nothing selectable the call records a bailout and `out` is left
    /// short.
    pub fn range_sample(
        &self,
        out: &mut Vec<Record>,
        lo: Key,
        hi: Key,
        k: usize,
        rng: &mut impl Rng,
    ) -> SampleStats {
        let mut stats = SampleStats::default();
        out.clear();
        if k == 0 || lo > hi {
            stats.bailout = true;
            return stats;
        }

        let memtable = self.active_memtable();
        let weighted = self.options.sampling == SamplingMode::Weighted;
        let rejection_memtable =
            !weighted && self.options.memtable_sampling == MemtableSampling::Rejection;

        // Descriptor 0 is always the memtable.
        let mut ranges: Vec<SampleRange> = Vec::with_capacity(1 + self.levels.len());
        let mut memtable_records: Vec<Record> = Vec::new();
        let mut memtable_alias: Option<Alias> = None;

        if rejection_memtable {
            let cutoff = memtable.record_count();
            ranges.push(SampleRange {
                source: SampleSource::MemTable,
                low: 0,
                high: cutoff,
                weight: cutoff as f64,
            });
        } else {
            memtable_records = memtable.sampling_vector(lo, hi);
            let weight = if weighted {
                let weights: Vec<f64> = memtable_records.iter().map(|r| r.weight).collect();
                let total: f64 = weights.iter().sum();
                if total > 0.0 {
                    memtable_alias = Some(Alias::new(&weights));
                }
                total
            } else {
                memtable_records.len() as f64
            };
            ranges.push(SampleRange {
                source: SampleSource::MemTable,
                low: 0,
                high: memtable_records.len(),
                weight,
            });
        }

        for level in &self.levels {
            level.get_sample_ranges(lo, hi, weighted, &mut ranges);
        }

        let masses: Vec<f64> = ranges.iter().map(|r| r.weight).collect();
        let total_mass: f64 = masses.iter().sum();
        if total_mass <= 0.0 {
            stats.bailout = true;
            return stats;
        }
        let level_mass = total_mass - masses[0];
        let alias = Alias::new(&masses);

        let mut per_range = vec![0usize; ranges.len()];
        // The first pass behaves as though every prior draw was rejected.
        let mut rejections = k;

        while out.len() < k {
            for _ in 0..rejections {
                per_range[alias.draw(rng)] += 1;
            }
            rejections = 0;

            for (ri, range) in ranges.iter().enumerate() {
                let want = mem::take(&mut per_range[ri]);
                if want == 0 {
                    continue;
                }

                match range.source {
                    SampleSource::MemTable => {
                        for _ in 0..want {
                            stats.attempts += 1;
                            let candidate = if rejection_memtable {
                                memtable.record_at(rng.gen_range(0..range.high))
                            } else if let Some(local) = &memtable_alias {
                                Some(memtable_records[local.draw(rng)])
                            } else {
                                Some(memtable_records[rng.gen_range(0..range.high)])
                            };

                            let accepted = candidate.is_some_and(|rec| {
                                if self.accepts(&rec, range.source, lo, hi, memtable, &mut stats) {
                                    out.push(rec);
                                    true
                                } else {
                                    false
                                }
                            });
                            if !accepted {
                                rejections += 1;
                                stats.rejections += 1;
                                stats.memtable_rejections += 1;
                            }
                        }
                    }
                    SampleSource::Run { level, run } => {
                        let Some(level_ref) = self.levels.get(level) else {
                            continue;
                        };
                        let Some(run_ref) = level_ref.run(run) else {
                            continue;
                        };

                        if weighted {
                            stats.attempts += want as u64;
                            let accepted = run_ref.sample_weighted(
                                range.low,
                                range.high,
                                want,
                                rng,
                                |rec| self.accepts(rec, range.source, lo, hi, memtable, &mut stats),
                                out,
                            );
                            rejections += want - accepted;
                            stats.rejections += (want - accepted) as u64;
                        } else {
                            for _ in 0..want {
                                stats.attempts += 1;
                                let idx = rng.gen_range(range.low..range.high);
                                let candidate = level_ref.record_at(run, idx).copied();
                                let accepted = candidate.is_some_and(|rec| {
                                    if self.accepts(&rec, range.source, lo, hi, memtable, &mut stats)
                                    {
                                        out.push(rec);
                                        true
                                    } else {
                                        false
                                    }
                                });
                                if !accepted {
                                    rejections += 1;
                                    stats.rejections += 1;
                                }
                            }
                        }
                    }
                }
            }

            // A rejection-sampled memtable keeps its full append region in
            // the alias, so an empty interval never zeroes the total mass.
            // One fruitless pass with no level mass proves the range empty.
            if out.is_empty() && rejection_memtable && level_mass <= 0.0 {
                stats.bailout = true;
                break;
            }
        }

        stats
    }

    /// Tombstone/bounds/deletion validation for one drawn candidate.
    fn accepts(
        &self,
        rec: &Record,
        source: SampleSource,
        lo: Key,
        hi: Key,
        memtable: &MemTable,
        stats: &mut SampleStats,
    ) -> bool {
        if rec.is_tombstone() {
            stats.tombstone_rejections += 1;
            return false;
        }
        if rec.key < lo || rec.key > hi {
            stats.bounds_rejections += 1;
            return false;
        }
        if self.is_deleted(rec, source, memtable) {
            stats.deletion_rejections += 1;
            return false;
        }
        true
    }

    /// Probes for a deletion shadowing `rec`: the delete tag on the record
    /// itself, the memtable's tombstones, every level above the record's
    /// origin, and the origin level's newer runs. A hit charges a rejection
    /// against the level holding the tombstone, so the rejection enforcer
    /// compacts the level whose tombstones are wasting the sampler's work.
    fn is_deleted(&self, rec: &Record, source: SampleSource, memtable: &MemTable) -> bool {
        if self.options.delete_policy == DeletePolicy::Tagged && rec.is_delete_tagged() {
            return true;
        }

        if memtable.check_tombstone(rec.key, rec.value) {
            return true;
        }

        let SampleSource::Run { level, run } = source else {
            return false;
        };

        for shallower in &self.levels[..level] {
            if shallower.tombstone_check_from(0, rec.key, rec.value) {
                shallower.note_rejection();
                return true;
            }
        }
        if self.levels[level].tombstone_check_from(run + 1, rec.key, rec.value) {
            self.levels[level].note_rejection();
            return true;
        }
        false
    }

    /// Flushes all buffered writes and rewrites the tree metadata.
    pub fn persist(&mut self) -> anyhow::Result<()> {
        if self.active_memtable().record_count() > 0 {
            self.flush_memtable()?;
        }
        meta::persist(&self.dir, &self.levels).context("persist tree metadata")?;
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        let buffered: usize = self.memtables.iter().map(MemTable::record_count).sum();
        buffered + self.levels.iter().map(Level::record_count).sum::<usize>()
    }

    pub fn tombstone_count(&self) -> usize {
        let buffered: usize = self.memtables.iter().map(MemTable::tombstone_count).sum();
        buffered
            + self
                .levels
                .iter()
                .map(Level::tombstone_count)
                .sum::<usize>()
    }

    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn memtable_capacity(&self) -> usize {
        self.memtables[0].capacity()
    }

    pub fn memory_utilization(&self) -> usize {
        let buffered: usize = self
            .memtables
            .iter()
            .map(MemTable::memory_utilization)
            .sum();
        buffered
            + self
                .levels
                .iter()
                .map(Level::memory_utilization)
                .sum::<usize>()
    }

    pub fn aux_memory_utilization(&self) -> usize {
        let buffered: usize = self
            .memtables
            .iter()
            .map(MemTable::aux_memory_utilization)
            .sum();
        buffered
            + self
                .levels
                .iter()
                .map(Level::aux_memory_utilization)
                .sum::<usize>()
    }

    pub fn options(&self) -> &LsmOptions {
        &self.options
    }

    /// Wasted-work ratio recorded against a level by past samples.
    pub fn rejection_rate(&self, level: usize) -> Option<f64> {
        self.levels.get(level).and_then(Level::rejection_rate)
    }

    /// Checks `tombstones(l) / capacity(l) <= max_tombstone_prop` on every
    /// level.
    pub fn validate_tombstone_proportion(&self) -> bool {
        self.levels.iter().enumerate().all(|(idx, level)| {
            level.tombstone_proportion(self.level_record_capacity(idx))
                <= self.options.max_tombstone_prop
        })
    }

    /// Full-scan check of the tombstone ordering invariant: no tombstone may
    /// sit below (deeper than, or in an older run than) a matching record.
    pub fn validate_tombstone_ordering(&self) -> bool {
        for (lvl_idx, level) in self.levels.iter().enumerate() {
            for (run_idx, run) in level.runs().iter().enumerate() {
                for rec in run.records().iter().filter(|r| r.is_tombstone()) {
                    let shadowed_above = self.levels[..lvl_idx]
                        .iter()
                        .any(|shallower| shallower.contains_live(rec.key, rec.value));
                    let shadowed_newer = level.runs()[run_idx + 1..]
                        .iter()
                        .any(|newer| newer.contains_live(rec.key, rec.value));
                    if shadowed_above || shadowed_newer {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// The active memtable. Spins while both buffers are mid-flush, which a
    /// single writer never observes.
    fn active_memtable(&self) -> &MemTable {
        loop {
            for idx in [self.active, 1 - self.active] {
                let mt = &self.memtables[idx];
                if mt.state() == MemTableState::Active {
                    return mt;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Builds the active memtable into level 0, cascading merges to make
    /// room first and enforcing the tombstone maximum afterwards. The paired
    /// buffer takes over as active for the duration.
    fn flush_memtable(&mut self) -> anyhow::Result<()> {
        let idx = self.active;
        self.memtables[idx].set_state(MemTableState::Flushing);
        self.active = 1 - idx;

        let count = self.memtables[idx].record_count();
        if count == 0 {
            self.memtables[idx].set_state(MemTableState::Retired);
            self.memtables[idx].truncate();
            return Ok(());
        }

        if !self.can_merge_with(0, count) {
            self.merge_down(0)?;
        }

        match self.options.policy {
            CompactionPolicy::Tiering => {
                self.levels[0].append_from_memtable(&self.memtables[idx], &mut self.filter_rng);
            }
            CompactionPolicy::Leveling => {
                let run = Run::from_memtable(&self.memtables[idx], &mut self.filter_rng);
                let base = mem::replace(&mut self.levels[0], Level::new(0, 1));
                self.levels[0] =
                    Level::merged(base, Level::with_run(0, 1, run), &mut self.filter_rng);
            }
        }
        self.enforce_tombstone_maximum(0)?;

        self.memtables[idx].set_state(MemTableState::Retired);
        self.memtables[idx].truncate();
        Ok(())
    }

    /// Makes room at `idx` by merging it into the first deeper level that
    /// can absorb it, growing the tree when none can. Merges run deepest
    /// first so each step only combines adjacent levels.
    fn merge_down(&mut self, idx: usize) -> anyhow::Result<()> {
        let base = match self.find_mergeable_level(idx) {
            Some(level) => level,
            None => self.grow()?,
        };

        for i in ((idx + 1)..=base).rev() {
            self.merge_levels(i, i - 1);
            self.enforce_tombstone_maximum(i)?;
        }
        Ok(())
    }

    fn find_mergeable_level(&self, idx: usize) -> Option<usize> {
        if idx >= self.levels.len() {
            return None;
        }
        let mut incoming = self.levels[idx].record_count();
        for j in (idx + 1)..self.levels.len() {
            if self.can_merge_with(j, incoming) {
                return Some(j);
            }
            incoming = self.levels[j].record_count();
        }
        None
    }

    /// Appends a fresh level at the bottom of the tree.
    fn grow(&mut self) -> anyhow::Result<usize> {
        if self.levels.len() >= self.options.memory_levels {
            bail!(
                "cannot grow past the configured budget of {} memory levels",
                self.options.memory_levels
            );
        }
        let idx = self.levels.len();
        self.levels.push(Level::new(idx, self.options.run_capacity()));
        Ok(idx)
    }

    /// Merges `incoming_idx` into `base_idx` (which must be the next level
    /// down) and retires the incoming level by swapping in a fresh one.
    fn merge_levels(&mut self, base_idx: usize, incoming_idx: usize) {
        let run_cap = self.options.run_capacity();
        let incoming = mem::replace(
            &mut self.levels[incoming_idx],
            Level::new(incoming_idx, run_cap),
        );

        match self.options.policy {
            CompactionPolicy::Leveling => {
                let base = mem::replace(&mut self.levels[base_idx], Level::new(base_idx, 1));
                self.levels[base_idx] = Level::merged(base, incoming, &mut self.filter_rng);
            }
            CompactionPolicy::Tiering => {
                self.levels[base_idx].append_merged(incoming, &mut self.filter_rng);
            }
        }
    }

    fn enforce_tombstone_maximum(&mut self, idx: usize) -> anyhow::Result<()> {
        let prop = self.levels[idx].tombstone_proportion(self.level_record_capacity(idx));
        if prop > self.options.max_tombstone_prop {
            self.merge_down(idx)?;
        }
        Ok(())
    }

    /// Settles rejection-rate violations recorded by past samples. Samplers
    /// are readers, so enforcement runs on the writer before its next
    /// mutation; merging a violating level turns its tombstones into
    /// cancellations.
    fn settle_rejection_debt(&mut self) -> anyhow::Result<()> {
        let Some(max_rate) = self.options.max_rejection_rate else {
            return Ok(());
        };

        for idx in 0..self.levels.len() {
            let over = self.levels[idx]
                .rejection_rate()
                .is_some_and(|rate| rate > max_rate);
            if over && self.levels[idx].record_count() > 0 {
                self.levels[idx].reset_rejection_stats();
                self.merge_down(idx)?;
            }
        }
        Ok(())
    }

    fn can_merge_with(&self, idx: usize, incoming: usize) -> bool {
        let Some(level) = self.levels.get(idx) else {
            return false;
        };
        match self.options.policy {
            CompactionPolicy::Leveling => {
                level.record_count() + incoming <= self.level_record_capacity(idx)
            }
            CompactionPolicy::Tiering => level.run_count() < self.options.scale_factor,
        }
    }

    /// Level capacity grows geometrically: `memtable_capacity * s^(idx+1)`.
    fn level_record_capacity(&self, idx: usize) -> usize {
        self.options
            .memtable_capacity
            .saturating_mul(self.options.scale_factor.saturating_pow(idx as u32 + 1))
    }
}
