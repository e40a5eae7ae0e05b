use anyhow::bail;

/// Compaction policy: a level holds one run (leveling) or up to
/// `scale_factor` runs (tiering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPolicy {
    Leveling,
    Tiering,
}

/// How deletes are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Append a tombstone record paired by `(key, value)`.
    Tombstone,
    /// Tag the matching record in place, falling back to a tombstone when no
    /// match is found in the levels or the memtable.
    Tagged,
}

/// Memtable strategy for the uniform sampling path. Ignored by the weighted
/// variant, which always samples a filtered in-range vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemtableSampling {
    /// Draw from the whole append region and reject out-of-range candidates.
    Rejection,
    /// Pre-filter the in-range records before drawing.
    Filtered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Samples are uniform over the live records in range.
    Uniform,
    /// Samples are proportional to per-record weight; the memtable is a
    /// balanced ordered structure and runs answer weighted range draws.
    Weighted,
}

#[derive(Debug, Clone)]
pub struct LsmOptions {
    pub memtable_capacity: usize,
    pub memtable_tombstone_capacity: usize,
    /// Geometric growth factor between level capacities; the run cap of a
    /// tiering level.
    pub scale_factor: usize,
    /// Hard budget on tree height; growing past it fails the triggering
    /// operation.
    pub memory_levels: usize,
    /// Per-level ceiling on `tombstones / level_capacity` enforced after
    /// every compaction.
    pub max_tombstone_prop: f64,
    /// Weighted variant: per-level ceiling on the sampler's
    /// rejections-per-tombstone-probe ratio; violations force a compaction.
    pub max_rejection_rate: Option<f64>,
    pub policy: CompactionPolicy,
    pub delete_policy: DeletePolicy,
    pub memtable_sampling: MemtableSampling,
    pub sampling: SamplingMode,
}

impl Default for LsmOptions {
    fn default() -> Self {
        Self {
            memtable_capacity: 12_000,
            memtable_tombstone_capacity: 3_000,
            scale_factor: 6,
            memory_levels: 64,
            max_tombstone_prop: 0.1,
            max_rejection_rate: None,
            policy: CompactionPolicy::Tiering,
            delete_policy: DeletePolicy::Tombstone,
            memtable_sampling: MemtableSampling::Rejection,
            sampling: SamplingMode::Uniform,
        }
    }
}

impl LsmOptions {
    pub(crate) fn run_capacity(&self) -> usize {
        match self.policy {
            CompactionPolicy::Leveling => 1,
            CompactionPolicy::Tiering => self.scale_factor,
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.memtable_capacity == 0 {
            bail!("memtable capacity must be positive");
        }
        if self.scale_factor < 2 {
            bail!("scale factor must be at least 2");
        }
        if self.memory_levels == 0 {
            bail!("at least one memory level is required");
        }
        if !(self.max_tombstone_prop > 0.0) {
            bail!("max tombstone proportion must be positive");
        }
        if let Some(rate) = self.max_rejection_rate {
            if !(rate > 0.0) {
                bail!("max rejection rate must be positive");
            }
        }
        Ok(())
    }
}
