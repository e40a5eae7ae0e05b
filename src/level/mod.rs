//! A level: an ordered group of runs within one LSM layer.
//!
//! A level owns up to `run_cap` runs (one in leveling mode, `scale_factor`
//! in tiering mode), stored oldest first, so a tombstone always lives in a
//! higher slot than any record it shadows within the same level. Levels are
//! retired by value: merges consume the incoming level's runs and the
//! controller swaps a freshly-constructed successor into its slot.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::memtable::MemTable;
use crate::record::{Key, Record, Value};
use crate::run::Run;
use crate::sampling::{SampleRange, SampleSource};

/// Rejection-rate tracking kicks in only after this many tombstone probes.
pub(crate) const REJECTION_CHECK_FLOOR: u64 = 128;

#[derive(Debug)]
pub struct Level {
    level_no: usize,
    run_cap: usize,
    runs: Vec<Run>,
    rejections: AtomicU64,
    ts_checks: AtomicU64,
}

impl Level {
    pub fn new(level_no: usize, run_cap: usize) -> Self {
        Self {
            level_no,
            run_cap,
            runs: Vec::with_capacity(run_cap),
            rejections: AtomicU64::new(0),
            ts_checks: AtomicU64::new(0),
        }
    }

    pub(crate) fn with_run(level_no: usize, run_cap: usize, run: Run) -> Self {
        let mut level = Self::new(level_no, run_cap);
        level.append_run(run);
        level
    }

    pub(crate) fn from_runs(level_no: usize, run_cap: usize, runs: Vec<Run>) -> Self {
        assert!(runs.len() <= run_cap, "level over run capacity");
        let mut level = Self::new(level_no, run_cap);
        level.runs = runs;
        level
    }

    /// Places a freshly built run in the next free slot.
    pub fn append_run(&mut self, run: Run) {
        assert!(self.runs.len() < self.run_cap, "level out of run slots");
        self.runs.push(run);
    }

    /// Builds a run from the memtable's sorted output into the next free
    /// slot.
    pub fn append_from_memtable(&mut self, memtable: &MemTable, rng: &mut impl Rng) {
        self.append_run(Run::from_memtable(memtable, rng));
    }

    /// Tiering: merge the incoming level's runs into a single new run
    /// appended here. A single-run level is moved without re-merging.
    pub fn append_merged(&mut self, incoming: Level, rng: &mut impl Rng) {
        let mut incoming_runs = incoming.runs;
        match incoming_runs.len() {
            0 => {}
            1 => {
                let Some(run) = incoming_runs.pop() else {
                    return;
                };
                self.append_run(run);
            }
            _ => {
                let inputs: Vec<&Run> = incoming_runs.iter().collect();
                let merged = Run::from_merge(&inputs, rng);
                self.append_run(merged);
            }
        }
    }

    /// Leveling: build the single-run successor of `base` absorbing
    /// `incoming`. Both levels are consumed; the result takes `base`'s slot.
    pub fn merged(base: Level, incoming: Level, rng: &mut impl Rng) -> Level {
        let level_no = base.level_no;
        let inputs: Vec<&Run> = base.runs.iter().chain(incoming.runs.iter()).collect();
        let run = match inputs.len() {
            0 => return Level::new(level_no, 1),
            _ => Run::from_merge(&inputs, rng),
        };
        Level::with_run(level_no, 1, run)
    }

    /// Appends one descriptor per run overlapping `[lo, hi]`. Weights carry
    /// record counts, or range weight when `weighted`.
    pub fn get_sample_ranges(&self, lo: Key, hi: Key, weighted: bool, out: &mut Vec<SampleRange>) {
        for (run_idx, run) in self.runs.iter().enumerate() {
            let low = run.lower_bound(lo);
            let high = run.upper_bound(hi);
            if low >= high {
                continue;
            }
            let weight = if weighted {
                run.range_weight(low, high)
            } else {
                (high - low) as f64
            };
            out.push(SampleRange {
                source: SampleSource::Run {
                    level: self.level_no,
                    run: run_idx,
                },
                low,
                high,
                weight,
            });
        }
    }

    /// Probes runs `first_run..` (the runs newer than a caller-held
    /// position) for a tombstone matching `(key, value)`.
    pub fn tombstone_check_from(&self, first_run: usize, key: Key, value: Value) -> bool {
        self.ts_checks.fetch_add(1, Ordering::Relaxed);
        self.runs[first_run.min(self.runs.len())..]
            .iter()
            .any(|run| run.check_tombstone(key, value))
    }

    /// Tags the first live match across this level's runs, newest first.
    pub fn delete_record(&mut self, key: Key, value: Value) -> bool {
        self.runs
            .iter_mut()
            .rev()
            .any(|run| run.delete_record(key, value))
    }

    pub(crate) fn contains_live(&self, key: Key, value: Value) -> bool {
        self.runs.iter().any(|run| run.contains_live(key, value))
    }

    pub fn run(&self, idx: usize) -> Option<&Run> {
        self.runs.get(idx)
    }

    pub fn record_at(&self, run_idx: usize, idx: usize) -> Option<&Record> {
        self.runs.get(run_idx).and_then(|run| run.record_at(idx))
    }

    pub fn level_no(&self) -> usize {
        self.level_no
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn record_count(&self) -> usize {
        self.runs.iter().map(Run::record_count).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.runs.iter().map(Run::tombstone_count).sum()
    }

    /// Tombstone share of this level's record capacity (supplied by the
    /// owner, which knows the tree's geometric growth).
    pub fn tombstone_proportion(&self, capacity: usize) -> f64 {
        self.tombstone_count() as f64 / capacity.max(1) as f64
    }

    pub fn memory_utilization(&self) -> usize {
        self.runs.iter().map(Run::memory_utilization).sum()
    }

    pub fn aux_memory_utilization(&self) -> usize {
        self.runs.iter().map(Run::aux_memory_utilization).sum()
    }

    pub(crate) fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Notes one sampler rejection caused by a tombstone held in this level.
    pub(crate) fn note_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Rejections per tombstone probe against this level. Merging a level
    /// with a high rate sinks its tombstones toward the records they shadow
    /// until cancellation retires them. `None` until enough probes have
    /// accumulated to be meaningful.
    pub fn rejection_rate(&self) -> Option<f64> {
        let checks = self.ts_checks.load(Ordering::Relaxed);
        if checks < REJECTION_CHECK_FLOOR {
            return None;
        }
        Some(self.rejections.load(Ordering::Relaxed) as f64 / checks as f64)
    }

    pub(crate) fn reset_rejection_stats(&self) {
        self.rejections.store(0, Ordering::Relaxed);
        self.ts_checks.store(0, Ordering::Relaxed);
    }
}
