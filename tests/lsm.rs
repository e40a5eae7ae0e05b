use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reservoirdb::{
    CompactionPolicy, DeletePolicy, LsmOptions, LsmTree, MemtableSampling, Record,
};
use tempfile::TempDir;

fn small_options() -> LsmOptions {
    LsmOptions {
        memtable_capacity: 100,
        memtable_tombstone_capacity: 100,
        scale_factor: 2,
        memory_levels: 100,
        max_tombstone_prop: 1.0,
        ..Default::default()
    }
}

fn open_tree(dir: &TempDir, options: LsmOptions) -> LsmTree {
    let mut rng = StdRng::seed_from_u64(0xDB);
    LsmTree::open(dir.path(), options, &mut rng).expect("open tree")
}

fn fill(tree: &mut LsmTree, range: std::ops::Range<u64>) {
    for i in range {
        assert!(tree.append(i, i, 1.0, false).expect("append"));
    }
}

#[test]
fn create_empty_tree() {
    let dir = TempDir::new().unwrap();
    let tree = open_tree(&dir, small_options());
    assert_eq!(tree.record_count(), 0);
    assert_eq!(tree.height(), 0);
    assert_eq!(tree.memtable_capacity(), 100);
}

#[test]
fn append_within_capacity_stays_in_memtable() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());
    fill(&mut tree, 0..100);
    assert_eq!(tree.record_count(), 100);
    assert_eq!(tree.height(), 0);
}

#[test]
fn append_past_capacity_flushes_to_level_zero() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());
    fill(&mut tree, 0..300);
    assert_eq!(tree.record_count(), 300);
    assert_eq!(tree.height(), 1);
}

#[test]
fn memtable_sample_stays_in_bounds() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());
    fill(&mut tree, 0..100);

    let mut rng = StdRng::seed_from_u64(4);
    let mut out = Vec::new();
    let stats = tree.range_sample(&mut out, 20, 50, 100, &mut rng);

    assert!(!stats.bailout);
    assert_eq!(out.len(), 100);
    assert!(out.iter().all(|r| r.key >= 20 && r.key <= 50));
    assert!(out.iter().all(|r| !r.is_tombstone()));
    // Rejection sampling over the whole buffer: the 69 out-of-range keys
    // cost bounds rejections on the way to 100 accepts.
    assert!(stats.attempts >= 100);
    assert_eq!(stats.rejections, stats.attempts - 100);
    assert!(stats.bounds_rejections > 0);
}

#[test]
fn multi_level_sample_stays_in_bounds() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());
    fill(&mut tree, 0..300);

    let mut rng = StdRng::seed_from_u64(5);
    let mut out = Vec::new();
    let stats = tree.range_sample(&mut out, 100, 250, 100, &mut rng);

    assert!(!stats.bailout);
    assert_eq!(out.len(), 100);
    assert!(out.iter().all(|r| r.key >= 100 && r.key <= 250));
}

#[test]
fn uniform_sample_frequencies_are_flat() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());
    fill(&mut tree, 0..300);

    let mut rng = StdRng::seed_from_u64(6);
    let mut out = Vec::new();
    let mut counts = vec![0u64; 300];
    let trials = 300;
    let k = 100;
    for _ in 0..trials {
        tree.range_sample(&mut out, 0, 299, k, &mut rng);
        assert_eq!(out.len(), k);
        for rec in &out {
            counts[rec.key as usize] += 1;
        }
    }

    // 30_000 draws over 300 live records: expect 100 per key. A +-50%
    // envelope is over five standard deviations out.
    let expected = (trials * k) as f64 / 300.0;
    for (key, count) in counts.iter().enumerate() {
        let ratio = *count as f64 / expected;
        assert!(
            (0.5..=1.5).contains(&ratio),
            "key {key} drawn {count} times (expected ~{expected})"
        );
    }
}

#[test]
fn tombstone_hides_record_from_samples() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());
    fill(&mut tree, 0..100);
    // The flush triggered by the tombstone append pushes the records into
    // level 0 while the tombstone stays in the fresh memtable.
    assert!(tree.delete(50, 50).unwrap());

    assert_eq!(tree.height(), 1);
    let mut rng = StdRng::seed_from_u64(7);
    let mut out = Vec::new();
    let mut deletion_rejections = 0;
    for _ in 0..10 {
        let stats = tree.range_sample(&mut out, 0, 99, 200, &mut rng);
        assert_eq!(out.len(), 200);
        assert!(out.iter().all(|r| r.key != 50));
        deletion_rejections += stats.deletion_rejections;
    }
    assert!(deletion_rejections > 0);
}

#[test]
fn cancelled_tombstones_leave_consistent_counts() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());

    assert!(tree.append(7, 7, 1.0, false).unwrap());
    assert!(tree.append(7, 7, 0.0, true).unwrap());
    assert!(tree.append(7, 7, 0.0, true).unwrap());
    assert_eq!(tree.tombstone_count(), 2);

    // Flushing cancels the record against one tombstone; the duplicate
    // tombstone survives with nothing left to shadow.
    tree.persist().unwrap();
    assert_eq!(tree.record_count(), 1);
    assert_eq!(tree.tombstone_count(), 1);
}

#[test]
fn empty_interval_bails_out() {
    let dir = TempDir::new().unwrap();
    let mut tree = open_tree(&dir, small_options());

    let mut rng = StdRng::seed_from_u64(8);
    let mut out = Vec::new();
    let stats = tree.range_sample(&mut out, 10, 20, 5, &mut rng);
    assert!(stats.bailout);
    assert!(out.is_empty());

    // A populated memtable with nothing in range rejects a full pass and
    // then bails rather than spinning.
    fill(&mut tree, 0..50);
    let stats = tree.range_sample(&mut out, 1000, 2000, 5, &mut rng);
    assert!(stats.bailout);
    assert!(out.is_empty());
    assert!(stats.bounds_rejections > 0);
}

#[test]
fn filtered_memtable_sampling_matches_rejection_mode() {
    let dir = TempDir::new().unwrap();
    let mut options = small_options();
    options.memtable_sampling = MemtableSampling::Filtered;
    let mut tree = open_tree(&dir, options);
    fill(&mut tree, 0..100);

    let mut rng = StdRng::seed_from_u64(9);
    let mut out = Vec::new();
    let stats = tree.range_sample(&mut out, 20, 50, 100, &mut rng);
    assert_eq!(out.len(), 100);
    assert!(out.iter().all(|r| r.key >= 20 && r.key <= 50));
    // Pre-filtered draws never land outside the interval.
    assert_eq!(stats.bounds_rejections, 0);

    let stats = tree.range_sample(&mut out, 1000, 2000, 5, &mut rng);
    assert!(stats.bailout);
    assert!(out.is_empty());
}

#[test]
fn leveling_policy_keeps_single_run_levels() {
    let dir = TempDir::new().unwrap();
    let mut options = small_options();
    options.policy = CompactionPolicy::Leveling;
    let mut tree = open_tree(&dir, options);

    fill(&mut tree, 0..400);
    assert_eq!(tree.record_count(), 400);
    assert_eq!(tree.height(), 2);

    let mut rng = StdRng::seed_from_u64(10);
    let mut out = Vec::new();
    tree.range_sample(&mut out, 50, 350, 64, &mut rng);
    assert_eq!(out.len(), 64);
    assert!(out.iter().all(|r| r.key >= 50 && r.key <= 350));
}

#[test]
fn tagged_delete_marks_levelled_record() {
    let dir = TempDir::new().unwrap();
    let mut options = small_options();
    options.delete_policy = DeletePolicy::Tagged;
    let mut tree = open_tree(&dir, options);

    fill(&mut tree, 0..150);
    assert_eq!(tree.height(), 1);

    assert!(tree.delete(10, 10).unwrap());
    // No tombstone was appended for a tagged delete.
    assert_eq!(tree.tombstone_count(), 0);

    let mut rng = StdRng::seed_from_u64(11);
    let mut out = Vec::new();
    let mut deletion_rejections = 0;
    for _ in 0..10 {
        let stats = tree.range_sample(&mut out, 0, 99, 200, &mut rng);
        assert_eq!(out.len(), 200);
        assert!(out.iter().all(|r| r.key != 10));
        deletion_rejections += stats.deletion_rejections;
    }
    assert!(deletion_rejections > 0);

    // A delete of an absent pair falls back to a tombstone.
    assert!(tree.delete(5000, 5000).unwrap());
    assert_eq!(tree.tombstone_count(), 1);
}

#[test]
fn persisted_tree_reopens_with_same_contents() {
    let dir = TempDir::new().unwrap();
    let (records, tombstones, height);
    {
        let mut tree = open_tree(&dir, small_options());
        fill(&mut tree, 0..250);
        tree.delete(17, 17).unwrap();
        tree.persist().unwrap();
        records = tree.record_count();
        tombstones = tree.tombstone_count();
        height = tree.height();
    }

    let tree = open_tree(&dir, small_options());
    assert_eq!(tree.record_count(), records);
    assert_eq!(tree.tombstone_count(), tombstones);
    assert_eq!(tree.height(), height);

    let mut rng = StdRng::seed_from_u64(12);
    let mut out = Vec::new();
    let stats = tree.range_sample(&mut out, 0, 249, 100, &mut rng);
    assert!(!stats.bailout);
    assert_eq!(out.len(), 100);
    assert!(out.iter().all(|r| r.key != 17));
}

#[test]
fn reopen_from_corrupt_metadata_fails() {
    let dir = TempDir::new().unwrap();
    {
        let mut tree = open_tree(&dir, small_options());
        fill(&mut tree, 0..150);
        tree.persist().unwrap();
    }
    std::fs::write(dir.path().join("level_0000.meta"), "memory nope 3 zero\n").unwrap();

    let mut rng = StdRng::seed_from_u64(13);
    assert!(LsmTree::open(dir.path(), small_options(), &mut rng).is_err());
}

#[test]
fn tombstone_cascade_holds_proportion_invariant() {
    let dir = TempDir::new().unwrap();
    let options = LsmOptions {
        memtable_capacity: 2_000,
        memtable_tombstone_capacity: 2_000,
        scale_factor: 4,
        memory_levels: 100,
        max_tombstone_prop: 0.01,
        ..Default::default()
    };
    let mut tree = open_tree(&dir, options);

    let mut rng = StdRng::seed_from_u64(0xCA5CADE);
    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();

    for i in 0..20_000u64 {
        let mut key: u64 = rng.gen();
        while !seen.insert(key) {
            key = rng.gen();
        }
        assert!(tree.append(key, i, 1.0, false).unwrap());
        live.push((key, i));

        if i % 5 == 4 {
            for _ in 0..3 {
                let victim = rng.gen_range(0..live.len());
                let (key, value) = live.swap_remove(victim);
                assert!(tree.delete(key, value).unwrap());
            }
        }

        if i % 500 == 499 {
            assert!(tree.validate_tombstone_proportion(), "violated at {i}");
        }
    }

    assert!(tree.validate_tombstone_proportion());
    assert!(tree.validate_tombstone_ordering());

    // Nothing deleted may appear in a sample over the full key space.
    let mut out: Vec<Record> = Vec::new();
    let stats = tree.range_sample(&mut out, 0, u64::MAX, 500, &mut rng);
    assert!(!stats.bailout);
    assert_eq!(out.len(), 500);
    let live_set: HashSet<(u64, u64)> = live.iter().copied().collect();
    assert!(out.iter().all(|r| live_set.contains(&(r.key, r.value))));
}

#[test]
fn record_count_tracks_appends_and_cancellations() {
    let dir = TempDir::new().unwrap();
    let mut options = small_options();
    options.policy = CompactionPolicy::Leveling;
    let mut tree = open_tree(&dir, options);

    fill(&mut tree, 0..120);
    assert_eq!(tree.record_count(), 120);

    // Delete twenty levelled records; tombstones count as records until a
    // merge cancels them.
    for i in 0..20u64 {
        assert!(tree.delete(i, i).unwrap());
    }
    assert_eq!(tree.record_count(), 140);
    assert_eq!(tree.tombstone_count(), 20);

    // The flush merges the buffered tombstones into the level-0 run, where
    // every pair cancels.
    tree.persist().unwrap();
    assert_eq!(tree.tombstone_count(), 0);
    assert_eq!(tree.record_count(), 100);
}
