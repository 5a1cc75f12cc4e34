//! Tests for parallel marking.
//!
//! A parallel cycle must reach exactly the objects a serial cycle reaches,
//! whatever the worker count and segment size.

use std::sync::Arc;

use strata_gc::simple::SimpleObjectModel;
use strata_gc::{GcKind, GcMetrics, Heap, HeapConfig, ObjectKind, ParallelMarkConfig, SpaceId};

const FANOUT: usize = 48;

fn parallel(workers: usize, segment_capacity: usize, threshold: usize) -> ParallelMarkConfig {
    let mut config = ParallelMarkConfig::new(workers);
    config.set_segment_capacity(segment_capacity);
    config.set_parallel_threshold(threshold);
    config
}

fn config(parallel: ParallelMarkConfig) -> HeapConfig {
    HeapConfig::default()
        .with_main_capacity(8 << 20)
        .with_bump_capacity(2 << 20)
        .with_regions(1 << 20, 64 << 10)
        .with_tlab_size(32 << 10)
        .with_parallel(parallel)
}

/// Builds a three-level tree with `FANOUT` children per inner node, spread
/// across the main, bump and region spaces, plus one unreachable leaf per
/// inner node. Returns the number of reachable objects.
fn build_tree(model: &SimpleObjectModel, mutator: &mut strata_gc::Mutator) -> usize {
    let root = model
        .alloc_object(mutator, SpaceId::Main, ObjectKind::Array, FANOUT, 0)
        .unwrap();
    let root_handle = mutator.new_root(Some(root));
    let spaces = [SpaceId::Main, SpaceId::Bump, SpaceId::Region];
    let mut reachable = 1;
    for i in 0..FANOUT {
        let inner = model
            .alloc_object(mutator, SpaceId::Main, ObjectKind::Container, FANOUT, 0)
            .unwrap();
        let root = mutator.root(root_handle).unwrap();
        model.set_field(mutator, root, i, Some(inner));
        let inner_handle = mutator.new_root(Some(inner));
        reachable += 1;
        for j in 0..FANOUT {
            let leaf = model
                .alloc_object(mutator, spaces[(i + j) % spaces.len()], ObjectKind::Scalar, 0, 16)
                .unwrap();
            let inner = mutator.root(inner_handle).unwrap();
            model.set_field(mutator, inner, j, Some(leaf));
            reachable += 1;
        }
        model
            .alloc_object(mutator, spaces[i % spaces.len()], ObjectKind::Scalar, 0, 16)
            .unwrap();
        mutator.release_root(inner_handle);
    }
    reachable
}

fn run(parallel: ParallelMarkConfig, kind: GcKind) -> (usize, GcMetrics) {
    let model = Arc::new(SimpleObjectModel::new());
    let heap = Heap::new(config(parallel), model.clone()).unwrap();
    let mut mutator = heap.attach_mutator("builder");
    let reachable = build_tree(&model, &mut mutator);
    let metrics = mutator.collect(kind, false);
    mutator.verify_heap().unwrap();
    (reachable, metrics)
}

#[test]
fn test_parallel_partial_marks_same_objects_as_serial() {
    let (reachable, serial) = run(ParallelMarkConfig::default(), GcKind::Partial);
    let (_, parallel) = run(parallel(4, 64, 32), GcKind::Partial);
    assert_eq!(serial.objects_marked, reachable);
    assert_eq!(parallel.objects_marked, reachable);
    assert_eq!(parallel.objects_freed, serial.objects_freed);
}

#[test]
fn test_parallel_compaction_marks_same_objects_as_serial() {
    let (reachable, serial) = run(ParallelMarkConfig::default(), GcKind::Full);
    let (_, parallel) = run(parallel(4, 64, 32), GcKind::Full);
    assert_eq!(serial.objects_marked, reachable);
    assert_eq!(parallel.objects_marked, reachable);
    assert_eq!(parallel.objects_moved, serial.objects_moved);
    assert_eq!(parallel.objects_freed, serial.objects_freed);
}

#[test]
fn test_tiny_segments_spill_without_losing_work() {
    let (reachable, metrics) = run(parallel(8, 2, 1), GcKind::Partial);
    assert_eq!(metrics.objects_marked, reachable);
}

#[test]
fn test_below_threshold_stays_serial() {
    let (reachable, metrics) = run(parallel(4, 1024, usize::MAX), GcKind::Partial);
    assert_eq!(metrics.objects_marked, reachable);
}

#[test]
fn test_single_worker_config_is_serial() {
    let config = ParallelMarkConfig::new(1);
    assert!(!config.use_parallel());
    let (reachable, metrics) = run(config, GcKind::Full);
    assert_eq!(metrics.objects_marked, reachable);
}
