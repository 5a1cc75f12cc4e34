//! Integration tests for per-collection metrics and cumulative statistics.

use std::sync::Arc;

use strata_gc::simple::SimpleObjectModel;
use strata_gc::{CollectionType, GcKind, Heap, HeapConfig, ObjectKind, SpaceId};

fn config() -> HeapConfig {
    HeapConfig::default()
        .with_main_capacity(2 << 20)
        .with_bump_capacity(1 << 20)
        .with_regions(256 << 10, 64 << 10)
        .with_tlab_size(16 << 10)
}

fn setup(config: HeapConfig) -> (Arc<SimpleObjectModel>, Arc<Heap>) {
    let model = Arc::new(SimpleObjectModel::new());
    let heap = Heap::new(config, model.clone()).unwrap();
    (model, heap)
}

#[test]
fn test_no_collection_yet() {
    let (_, heap) = setup(config());
    let metrics = heap.last_gc_metrics();
    assert_eq!(metrics.collection_type, CollectionType::None);
    assert_eq!(metrics.gc_id, 0);
    assert_eq!(heap.stats().total_collections(), 0);
}

#[test]
fn test_gc_ids_increase() {
    let (_, heap) = setup(config());
    let mut mutator = heap.attach_mutator("main");
    let ids: Vec<u64> = (0..4)
        .map(|i| {
            let kind = if i % 2 == 0 { GcKind::Partial } else { GcKind::Full };
            mutator.collect(kind, false).gc_id
        })
        .collect();
    assert_eq!(ids, [1, 2, 3, 4]);
    assert_eq!(heap.last_gc_metrics().gc_id, 4);
}

#[test]
fn test_collection_type_follows_config() {
    let cases = [
        (config(), GcKind::Partial, CollectionType::ConcurrentMarkSweep),
        (config(), GcKind::Full, CollectionType::MarkCompact),
        (config().with_concurrent(false), GcKind::Partial, CollectionType::MarkSweep),
        (config().with_full_gc_compacts(false), GcKind::Full, CollectionType::MarkSweep),
        (
            config().with_bump_capacity(0).with_regions(0, 64 << 10),
            GcKind::Full,
            CollectionType::MarkSweep,
        ),
    ];
    for (config, kind, expected) in cases {
        let (_, heap) = setup(config);
        let mut mutator = heap.attach_mutator("main");
        assert_eq!(mutator.collect(kind, false).collection_type, expected, "{kind:?}");
    }
}

#[test]
fn test_phase_timing_fits_in_duration() {
    let (model, heap) = setup(config());
    let mut mutator = heap.attach_mutator("main");
    for _ in 0..500 {
        model
            .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 32)
            .unwrap();
    }

    for kind in [GcKind::Partial, GcKind::Full] {
        let metrics = mutator.collect(kind, false);
        let phases =
            metrics.mark_duration + metrics.reference_duration + metrics.sweep_duration + metrics.compact_duration;
        assert!(phases <= metrics.duration, "{phases:?} > {:?}", metrics.duration);
        assert!(metrics.pause_duration <= metrics.duration);
    }
}

#[test]
fn test_compact_duration_only_for_compaction() {
    let (model, heap) = setup(config());
    let mut mutator = heap.attach_mutator("main");
    model
        .alloc_object(&mut mutator, SpaceId::Bump, ObjectKind::Scalar, 0, 8)
        .unwrap();

    let partial = mutator.collect(GcKind::Partial, false);
    assert!(partial.compact_duration.is_zero());
    let full = mutator.collect(GcKind::Full, false);
    assert_eq!(full.collection_type, CollectionType::MarkCompact);
    assert_eq!(full.pauses, 1);
    assert_eq!(full.objects_freed, 1);
}

#[test]
fn test_bytes_allocated_before_and_after() {
    let (model, heap) = setup(config());
    let mut mutator = heap.attach_mutator("main");
    let size = SimpleObjectModel::object_size(0, 24);
    for _ in 0..100 {
        model
            .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 24)
            .unwrap();
    }
    let before = heap.bytes_allocated();

    let metrics = mutator.collect(GcKind::Partial, false);
    assert_eq!(metrics.bytes_allocated_before, before);
    assert_eq!(metrics.bytes_freed, 100 * size);
    assert_eq!(metrics.bytes_allocated_after, before - 100 * size);
    assert_eq!(heap.bytes_allocated(), metrics.bytes_allocated_after);
}

#[test]
fn test_stats_accumulate_across_collections() {
    let (model, heap) = setup(config());
    let mut mutator = heap.attach_mutator("main");
    let mut freed = 0;
    for round in 0..3 {
        for _ in 0..10 {
            model
                .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 8)
                .unwrap();
        }
        let kind = if round == 2 { GcKind::Full } else { GcKind::Partial };
        freed += mutator.collect(kind, false).objects_freed;
    }
    let stats = heap.stats();
    assert_eq!(freed, 30);
    assert_eq!(stats.total_collections(), 3);
    assert_eq!(stats.concurrent_collections(), 2);
    assert_eq!(stats.compactions(), 1);
    assert_eq!(stats.paused_collections(), 0);
    assert_eq!(stats.total_objects_freed(), 30);
    assert_eq!(stats.total_objects_allocated(), 30);
    assert!(stats.total_pause_time() <= stats.total_gc_time());
}

#[test]
fn test_collection_cleans_dirty_cards() {
    let (model, heap) = setup(config());
    let mut mutator = heap.attach_mutator("main");
    let holder = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Container, 1, 0)
        .unwrap();
    let _root = mutator.new_root(Some(holder));
    let target = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 8)
        .unwrap();
    model.set_field(&mutator, holder, 0, Some(target));
    assert!(heap.card_table().is_dirty(holder.addr()));

    let metrics = mutator.collect(GcKind::Partial, false);
    assert_eq!(metrics.objects_marked, 2);
    assert!(!heap.card_table().is_dirty(holder.addr()));
}
