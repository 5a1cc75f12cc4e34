//! Benchmark: write barrier and card marking cost.
//!
//! The barrier runs on every reference store, so it has to stay a store
//! plus a card byte write.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use strata_gc::gc::card_table::CARD_SIZE;
use strata_gc::simple::SimpleObjectModel;
use strata_gc::space::ContinuousSpace;
use strata_gc::{Heap, HeapConfig, ObjectKind, SpaceId};

const FIELDS: usize = 64;

fn heap() -> (Arc<SimpleObjectModel>, Arc<Heap>) {
    let model = Arc::new(SimpleObjectModel::new());
    let config = HeapConfig::default()
        .with_main_capacity(4 << 20)
        .with_bump_capacity(1 << 20)
        .with_regions(1 << 20, 64 << 10);
    let heap = Heap::new(config, model.clone()).expect("heap");
    (model, heap)
}

fn bench_write_reference(c: &mut Criterion) {
    let (model, heap) = heap();
    let mut mutator = heap.attach_mutator("bench");
    let holder = model
        .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Array, FIELDS, 0)
        .expect("holder");
    let _root = mutator.new_root(Some(holder));
    let target = model
        .alloc_object(&mut mutator, SpaceId::Bump, ObjectKind::Scalar, 0, 8)
        .expect("target");
    let slots: Vec<_> = (0..FIELDS).map(|i| model.field(holder, i)).collect();

    c.bench_function("write_reference_64_fields", |b| {
        b.iter(|| {
            for &slot in &slots {
                mutator.write_reference(holder, slot, black_box(Some(target)));
            }
        });
    });
}

fn bench_mark_card(c: &mut Criterion) {
    let (_model, heap) = heap();
    let begin = heap.main_space().begin();
    c.bench_function("mark_card_1024_cards", |b| {
        b.iter(|| {
            for i in 0..1024 {
                heap.mark_card(black_box(begin + i * CARD_SIZE));
            }
        });
    });
}

criterion_group!(benches, bench_write_reference, bench_mark_card);
criterion_main!(benches);
