use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use reservoirdb::{LsmOptions, LsmTree, Record, SamplingMode};

fn options() -> LsmOptions {
    LsmOptions {
        memtable_capacity: 12_000,
        memtable_tombstone_capacity: 4_000,
        scale_factor: 6,
        memory_levels: 64,
        max_tombstone_prop: 0.05,
        ..Default::default()
    }
}

fn build_tree(n: u64, sampling: SamplingMode) -> (TempDir, LsmTree) {
    let dir = TempDir::new().expect("tempdir");
    let mut rng = StdRng::seed_from_u64(0xBE7C);
    let opts = LsmOptions {
        sampling,
        ..options()
    };
    let mut tree = LsmTree::open(dir.path(), opts, &mut rng).expect("open");
    for i in 0..n {
        let weight = (i % 16 + 1) as f64;
        tree.append(i, i, weight, false).expect("append");
    }
    (dir, tree)
}

fn bench_uniform_sample(c: &mut Criterion) {
    let (_dir, tree) = build_tree(100_000, SamplingMode::Uniform);
    let mut rng = StdRng::seed_from_u64(1);
    let mut out: Vec<Record> = Vec::with_capacity(1_000);

    c.bench_function("range_sample/uniform/100k/k=1000", |b| {
        b.iter(|| {
            let lo = rng.gen_range(0..50_000u64);
            let stats = tree.range_sample(&mut out, lo, lo + 40_000, 1_000, &mut rng);
            assert!(!stats.bailout);
        });
    });
}

fn bench_weighted_sample(c: &mut Criterion) {
    let (_dir, tree) = build_tree(100_000, SamplingMode::Weighted);
    let mut rng = StdRng::seed_from_u64(2);
    let mut out: Vec<Record> = Vec::with_capacity(1_000);

    c.bench_function("range_sample/weighted/100k/k=1000", |b| {
        b.iter(|| {
            let stats = tree.range_sample(&mut out, 20_000, 80_000, 1_000, &mut rng);
            assert!(!stats.bailout);
        });
    });
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("append/50k", |b| {
        b.iter_with_large_drop(|| {
            let (dir, mut tree) = build_tree(0, SamplingMode::Uniform);
            for i in 0..50_000u64 {
                tree.append(i, i, 1.0, false).expect("append");
            }
            (dir, tree)
        });
    });
}

criterion_group!(
    benches,
    bench_uniform_sample,
    bench_weighted_sample,
    bench_append
);
criterion_main!(benches);
