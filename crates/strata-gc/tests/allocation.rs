//! Allocation paths: TLABs, collection on exhaustion and allocation errors.

use std::sync::Arc;

use strata_gc::simple::SimpleObjectModel;
use strata_gc::space::ContinuousSpace;
use strata_gc::{AllocError, ConfigError, Heap, HeapConfig, HeapError, ObjectKind, SpaceId};

/// A heap with nothing but a 64 KiB main space.
fn main_only() -> HeapConfig {
    HeapConfig::default()
        .with_main_capacity(64 << 10)
        .with_bump_capacity(0)
        .with_regions(0, 64 << 10)
}

fn setup(config: HeapConfig) -> (Arc<SimpleObjectModel>, Arc<Heap>) {
    let model = Arc::new(SimpleObjectModel::new());
    let heap = Heap::new(config, model.clone()).unwrap();
    (model, heap)
}

#[test]
fn test_exhausted_space_collects_before_failing() {
    let (model, heap) = setup(main_only());
    let mut mutator = heap.attach_mutator("main");
    let object_size = SimpleObjectModel::object_size(0, 1000);

    // Each object takes a 1 KiB chunk.
    let mut roots = Vec::new();
    for _ in 0..64 {
        let obj = model
            .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 1000)
            .unwrap();
        roots.push(mutator.new_root(Some(obj)));
    }
    let collections = heap.stats().total_collections();

    let err = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 1000)
        .unwrap_err();
    assert_eq!(
        err,
        AllocError::OutOfMemory {
            space: SpaceId::Main,
            bytes: object_size,
        }
    );
    assert_eq!(heap.stats().total_collections(), collections + 2);
    assert!(heap.last_gc_metrics().clear_soft_references, "the last attempt clears soft references");

    mutator.release_root(roots.pop().unwrap());
    let obj = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 1000)
        .unwrap();
    assert!(heap.is_live(obj));
}

#[test]
fn test_garbage_never_exhausts_the_heap() {
    let (model, heap) = setup(main_only());
    let mut mutator = heap.attach_mutator("main");
    for _ in 0..1000 {
        model
            .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 1000)
            .unwrap();
    }
    assert!(heap.stats().total_collections() > 0);
    assert!(heap.stats().total_objects_freed() > 0);
}

#[test]
fn test_missing_space_is_reported() {
    let (model, heap) = setup(main_only());
    let mut mutator = heap.attach_mutator("main");
    for space in [SpaceId::Bump, SpaceId::Region, SpaceId::Immune] {
        let err = model
            .alloc_object(&mut mutator, space, ObjectKind::Scalar, 0, 8)
            .unwrap_err();
        assert_eq!(err, AllocError::NoSuchSpace(space));
    }
    assert_eq!(heap.stats().total_collections(), 0, "a missing space never triggers a collection");
}

#[test]
fn test_oversized_request_fails() {
    let (model, heap) = setup(main_only());
    let mut mutator = heap.attach_mutator("main");
    let err = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 128 << 10)
        .unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { space: SpaceId::Main, .. }));
}

#[test]
fn test_large_objects_use_page_chunks() {
    let (model, heap) = setup(main_only());
    let mut mutator = heap.attach_mutator("main");
    let large = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 5000)
        .unwrap();
    let small = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 8)
        .unwrap();
    assert_eq!(small.addr() - large.addr(), 8192);
    assert_eq!(heap.main_space().allocation_size(large), Some(8192));
    assert_eq!(heap.main_space().allocation_size(small), Some(16));
}

#[test]
fn test_small_bump_objects_share_a_tlab() {
    let config = HeapConfig::default()
        .with_main_capacity(1 << 20)
        .with_bump_capacity(1 << 20)
        .with_regions(0, 64 << 10)
        .with_tlab_size(16 << 10);
    let (model, heap) = setup(config);
    let bump = heap.bump_space().unwrap();
    let mut mutator = heap.attach_mutator("main");
    let size = SimpleObjectModel::object_size(0, 24);

    let first = model
        .alloc_object(&mut mutator, SpaceId::Bump, ObjectKind::Scalar, 0, 24)
        .unwrap();
    assert_eq!(bump.end(), bump.begin() + (16 << 10), "the whole TLAB is claimed at once");
    let second = model
        .alloc_object(&mut mutator, SpaceId::Bump, ObjectKind::Scalar, 0, 24)
        .unwrap();
    assert_eq!(second.addr(), first.addr() + size);
    assert_eq!(bump.objects_allocated(), 2);
    assert_eq!(bump.bytes_allocated(), 2 * size);

    // Larger than half a TLAB: its own block after the TLAB.
    let large = model
        .alloc_object(&mut mutator, SpaceId::Bump, ObjectKind::Scalar, 0, 10 << 10)
        .unwrap();
    assert!(large.addr() > bump.begin() + (16 << 10));
}

#[test]
fn test_mutators_have_separate_tlabs() {
    let config = HeapConfig::default()
        .with_main_capacity(1 << 20)
        .with_bump_capacity(1 << 20)
        .with_regions(0, 64 << 10)
        .with_tlab_size(16 << 10);
    let (model, heap) = setup(config);
    let mut first = heap.attach_mutator("first");
    let mut second = heap.attach_mutator("second");
    assert_eq!(heap.mutator_count(), 2);

    let a = model
        .alloc_object(&mut first, SpaceId::Bump, ObjectKind::Scalar, 0, 8)
        .unwrap();
    let b = model
        .alloc_object(&mut second, SpaceId::Bump, ObjectKind::Scalar, 0, 8)
        .unwrap();
    assert!(b.addr().abs_diff(a.addr()) >= 16 << 10);

    drop(second);
    assert_eq!(heap.mutator_count(), 1);
}

#[test]
fn test_invalid_configs_are_rejected() {
    let model = Arc::new(SimpleObjectModel::new());
    let err = Heap::new(HeapConfig::default().with_main_capacity(0), model.clone()).unwrap_err();
    assert!(matches!(err, HeapError::Config(ConfigError::MissingMainSpace)));

    let err = Heap::new(HeapConfig::default().with_main_capacity(1000), model.clone()).unwrap_err();
    assert!(matches!(
        err,
        HeapError::Config(ConfigError::UnalignedCapacity { space: "main", bytes: 1000 })
    ));

    let err = Heap::new(HeapConfig::default().with_regions(1 << 20, 3000), model.clone()).unwrap_err();
    assert!(matches!(err, HeapError::Config(ConfigError::InvalidRegionSize(3000))));

    let err = Heap::new(HeapConfig::default().with_tlab_size(0), model).unwrap_err();
    assert!(matches!(err, HeapError::Config(ConfigError::InvalidTlabSize(0))));
}
