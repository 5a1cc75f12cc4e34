//! Loom tests for card aging racing the write barrier.
//!
//! The barrier dirties a card with a plain store while the collector ages it
//! with a CAS loop. A dirty value written by the barrier must never be lost:
//! the card ends up dirty or aged, never clean.

use loom::sync::atomic::{AtomicU8, Ordering};
use loom::sync::Arc;

use strata_gc::gc::card_table::{age_card, CARD_AGED, CARD_CLEAN, CARD_DIRTY};

/// The collector's side, as the card table performs it.
fn age(card: &AtomicU8) {
    let mut current = card.load(Ordering::Acquire);
    loop {
        let new = age_card(current);
        if new == current {
            break;
        }
        match card.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn barrier_races_aging(initial: u8) {
    loom::model(move || {
        let card = Arc::new(AtomicU8::new(initial));

        let barrier = loom::thread::spawn({
            let card = Arc::clone(&card);
            move || card.store(CARD_DIRTY, Ordering::Release)
        });
        let collector = loom::thread::spawn({
            let card = Arc::clone(&card);
            move || age(&card)
        });

        barrier.join().unwrap();
        collector.join().unwrap();

        let value = card.load(Ordering::Acquire);
        assert!(value == CARD_DIRTY || value == CARD_AGED, "lost a barrier store: {value:#x}");
        assert_ne!(value, CARD_CLEAN);
    });
}

#[test]
#[ignore = "loom test - run with cargo test loom_card_table --release -- --ignored"]
fn test_barrier_on_clean_card_survives_aging() {
    barrier_races_aging(CARD_CLEAN);
}

#[test]
#[ignore = "loom test - run with cargo test loom_card_table --release -- --ignored"]
fn test_barrier_on_dirty_card_survives_aging() {
    barrier_races_aging(CARD_DIRTY);
}

#[test]
#[ignore = "loom test - run with cargo test loom_card_table --release -- --ignored"]
fn test_barrier_on_aged_card_survives_aging() {
    barrier_races_aging(CARD_AGED);
}

/// Two aging passes without a store in between take a dirty card to clean.
#[test]
#[ignore = "loom test - run with cargo test loom_card_table --release -- --ignored"]
fn test_concurrent_aging_passes() {
    loom::model(|| {
        let card = Arc::new(AtomicU8::new(CARD_DIRTY));
        let first = loom::thread::spawn({
            let card = Arc::clone(&card);
            move || age(&card)
        });
        let second = loom::thread::spawn({
            let card = Arc::clone(&card);
            move || age(&card)
        });
        first.join().unwrap();
        second.join().unwrap();

        let value = card.load(Ordering::Acquire);
        assert!(value == CARD_AGED || value == CARD_CLEAN);
    });
}
