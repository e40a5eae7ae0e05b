//! Tombstone bloom filter.
//!
//! Filters are sized from the expected tombstone count, never the record
//! count: they are a tombstone index gating the linear probes in
//! `check_tombstone`, not a general membership oracle. Membership is a
//! superset of the inserted keys, so a negative probe is authoritative.

use std::hash::{BuildHasher, Hash, Hasher};

use rand::Rng;

use crate::record::Key;

/// Target false-positive rate for tombstone filters.
pub const BF_FPR: f64 = 0.01;
/// Hash function count for tombstone filters.
pub const BF_HASH_FUNCS: u32 = 7;

/// Double-hashing (Kirsch-Mitzenmacher) bloom filter with RNG-derived seeds.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    hashers: [ahash::RandomState; 2],
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish_non_exhaustive()
    }
}

impl BloomFilter {
    /// Sizes the filter for `expected_keys` at the given false-positive rate.
    /// Seeds are drawn from `rng` so filter behavior is reproducible under an
    /// injected generator.
    pub fn new(fp_rate: f64, expected_keys: usize, num_hashes: u32, rng: &mut impl Rng) -> Self {
        let expected_keys = expected_keys.max(1);
        let fp_rate = fp_rate.clamp(1e-10, 0.5);

        // m = -n * ln(p) / (ln 2)^2
        let num_bits =
            (-(expected_keys as f64) * fp_rate.ln() / 2.0_f64.ln().powi(2)).ceil() as usize;
        let num_bits = num_bits.max(64);

        let hashers = [
            ahash::RandomState::with_seeds(rng.gen(), rng.gen(), rng.gen(), rng.gen()),
            ahash::RandomState::with_seeds(rng.gen(), rng.gen(), rng.gen(), rng.gen()),
        ];

        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes: num_hashes.clamp(1, 30),
            hashers,
        }
    }

    pub fn insert(&mut self, key: Key) {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[idx / 64] |= 1u64 << (idx % 64);
        }
    }

    /// Returns `false` only when the key was definitely never inserted.
    pub fn lookup(&self, key: Key) -> bool {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            if self.bits[idx / 64] & (1u64 << (idx % 64)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn memory_utilization(&self) -> usize {
        self.bits.len() * 8
    }

    fn hash_pair(&self, key: Key) -> (u64, u64) {
        let mut h1 = self.hashers[0].build_hasher();
        key.hash(&mut h1);
        let mut h2 = self.hashers[1].build_hasher();
        key.hash(&mut h2);
        (h1.finish(), h2.finish())
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn no_false_negatives() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut bf = BloomFilter::new(BF_FPR, 1000, BF_HASH_FUNCS, &mut rng);
        for key in 0..1000u64 {
            bf.insert(key);
        }
        for key in 0..1000u64 {
            assert!(bf.lookup(key));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut rng = SmallRng::seed_from_u64(2);
        let n = 10_000usize;
        let mut bf = BloomFilter::new(BF_FPR, n, BF_HASH_FUNCS, &mut rng);
        for key in 0..n as u64 {
            bf.insert(key);
        }

        let probes = 10_000u64;
        let false_positives = (n as u64..n as u64 + probes)
            .filter(|&key| bf.lookup(key))
            .count();
        let rate = false_positives as f64 / probes as f64;
        assert!(rate < 0.03, "false positive rate too high: {rate:.4}");
    }

    #[test]
    fn clear_resets_membership() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut bf = BloomFilter::new(BF_FPR, 16, BF_HASH_FUNCS, &mut rng);
        bf.insert(42);
        assert!(bf.lookup(42));
        bf.clear();
        assert!(!bf.lookup(42));
    }
}
