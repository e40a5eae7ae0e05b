//! Sample-range descriptors and per-call sampling statistics.

use crate::record::Weight;

/// Where a drawn candidate came from; deletion validation walks everything
/// strictly newer than this position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// The active memtable (always descriptor index 0).
    MemTable,
    /// A run, addressed by level index and run slot within the level.
    Run { level: usize, run: usize },
}

/// One per-run descriptor for a range sample: record indices `[low, high)`
/// inside the source run.
#[derive(Debug, Clone, Copy)]
pub struct SampleRange {
    pub source: SampleSource,
    pub low: usize,
    pub high: usize,
    /// Selection mass: the record count of the index range, or its total
    /// record weight in the weighted variant.
    pub weight: Weight,
}

/// Counters for a single `range_sample` call. Rejections are not errors;
/// they measure wasted validation work and feed the rejection-ratio
/// enforcement in the weighted variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    /// Candidate draws, accepted or not.
    pub attempts: u64,
    /// Total rejected draws.
    pub rejections: u64,
    /// Candidate carried the tombstone bit.
    pub tombstone_rejections: u64,
    /// Candidate key fell outside the query interval.
    pub bounds_rejections: u64,
    /// Candidate was shadowed by a tombstone or delete tag.
    pub deletion_rejections: u64,
    /// Rejections of candidates drawn from the memtable.
    pub memtable_rejections: u64,
    /// The call returned early: the interval held no selectable records.
    pub bailout: bool,
}
