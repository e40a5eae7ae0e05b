//! `reservoirdb` is a sampling-oriented log-structured merge tree.
//!
//! Where a conventional LSM answers point and range lookups, this engine's
//! distinguishing operation is independent-sample extraction: given a key
//! interval and a sample size `k`, it returns `k` records drawn uniformly
//! (or proportionally to per-record weight) from the live records in the
//! interval.
//!
//! The crate is intentionally opinionated about correctness first:
//! - Records are fixed width and ordered by `(key, value, header)`.
//! - Deletes are tombstones paired by `(key, value)` (or in-place delete
//!   tags), and tombstones always live above the records they shadow.
//! - Compactions settle before the triggering write returns, so samplers
//!   never observe a mid-compaction level vector.
//! - Every drawn candidate is validated against tombstones, bounds, and
//!   deletions before it lands in a sample; rejected draws are refilled.
//!
//! Mutating operations take `&mut LsmTree` and samplers take `&LsmTree`,
//! encoding the single-writer/overlapping-readers model in the type system.

pub mod alias;
pub mod bloom;
pub mod level;
pub mod memtable;
pub mod meta;
pub mod record;
pub mod run;
pub mod sampling;
pub mod tree;

pub use record::{Key, Record, Value, Weight};
pub use sampling::{SampleRange, SampleSource, SampleStats};
pub use tree::{
    CompactionPolicy, DeletePolicy, LsmOptions, LsmTree, MemtableSampling, SamplingMode,
};
