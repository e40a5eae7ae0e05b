//! Walker/Vose alias structure: O(n) build, O(1) categorical draw.
//!
//! Built over the per-descriptor weights during a range sample and over the
//! in-range segment weights inside a run's weighted draw. Zero-weight
//! entries are legal and are never returned; the total weight must be
//! positive and the input non-empty.

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Alias {
    prob: Vec<f64>,
    alias: Vec<usize>,
}

impl Alias {
    pub fn new(weights: &[f64]) -> Self {
        let n = weights.len();
        let total: f64 = weights.iter().sum();
        assert!(n > 0 && total > 0.0, "alias requires positive total weight");

        let mut prob = vec![0.0f64; n];
        let mut alias: Vec<usize> = (0..n).collect();

        let mut scaled: Vec<f64> = weights.iter().map(|w| w * n as f64 / total).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, s) in scaled.iter().enumerate() {
            if *s < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        loop {
            match (small.pop(), large.pop()) {
                (Some(s), Some(l)) => {
                    prob[s] = scaled[s];
                    alias[s] = l;
                    scaled[l] = (scaled[l] + scaled[s]) - 1.0;
                    if scaled[l] < 1.0 {
                        small.push(l);
                    } else {
                        large.push(l);
                    }
                }
                // Numerical leftovers land at probability one.
                (Some(i), None) | (None, Some(i)) => prob[i] = 1.0,
                (None, None) => break,
            }
        }

        Self { prob, alias }
    }

    pub fn draw(&self, rng: &mut impl Rng) -> usize {
        let column = rng.gen_range(0..self.prob.len());
        if rng.gen::<f64>() < self.prob[column] {
            column
        } else {
            self.alias[column]
        }
    }

    pub fn len(&self) -> usize {
        self.prob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }

    pub fn memory_utilization(&self) -> usize {
        self.prob.len() * (std::mem::size_of::<f64>() + std::mem::size_of::<usize>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn draws_follow_weights() {
        let alias = Alias::new(&[1.0, 3.0, 6.0]);
        let mut rng = SmallRng::seed_from_u64(7);

        let trials = 100_000;
        let mut counts = [0usize; 3];
        for _ in 0..trials {
            counts[alias.draw(&mut rng)] += 1;
        }

        let expected = [0.1, 0.3, 0.6];
        for (count, want) in counts.iter().zip(expected) {
            let got = *count as f64 / trials as f64;
            assert!((got - want).abs() < 0.02, "got {got:.3}, want {want:.3}");
        }
    }

    #[test]
    fn zero_weight_entries_are_never_drawn() {
        let alias = Alias::new(&[0.0, 1.0, 0.0]);
        let mut rng = SmallRng::seed_from_u64(8);
        for _ in 0..10_000 {
            assert_eq!(alias.draw(&mut rng), 1);
        }
    }

    #[test]
    fn single_entry_always_wins() {
        let alias = Alias::new(&[42.0]);
        let mut rng = SmallRng::seed_from_u64(9);
        assert_eq!(alias.draw(&mut rng), 0);
        assert_eq!(alias.len(), 1);
    }
}
