//! Card table for the write barrier.
//!
//! One byte covers [`CARD_SIZE`] bytes of the heap reservation. Mutators
//! dirty the card of an object whenever they store a reference into it; the
//! concurrent collector ages and rescans dirty cards to catch stores into
//! objects it has already scanned.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::gc::mark::HeapBitmap;
use crate::object::ObjectRef;

/// log2 of the card size.
pub const CARD_SHIFT: usize = 7;
/// Bytes covered by one card.
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;

/// No store since the card was last cleared or aged out.
pub const CARD_CLEAN: u8 = 0x00;
/// A reference was stored into an object starting on this card.
pub const CARD_DIRTY: u8 = 0x70;
/// Dirty before the most recent aging pass.
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

/// The aging step: dirty becomes aged, everything else becomes clean.
#[inline]
#[must_use]
pub const fn age_card(value: u8) -> u8 {
    if value == CARD_DIRTY {
        CARD_AGED
    } else {
        CARD_CLEAN
    }
}

/// Card bytes for `[begin, begin + len)`.
pub struct CardTable {
    begin: usize,
    len: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Creates an all-clean table for `len` bytes starting at `begin`.
    ///
    /// # Panics
    ///
    /// Panics if `begin` is not card aligned.
    #[must_use]
    pub fn new(begin: usize, len: usize) -> Self {
        assert!(begin % CARD_SIZE == 0, "card table base must be card aligned");
        let cards = (0..len.div_ceil(CARD_SIZE))
            .map(|_| AtomicU8::new(CARD_CLEAN))
            .collect();
        Self { begin, len, cards }
    }

    /// First covered address.
    #[must_use]
    pub const fn begin(&self) -> usize {
        self.begin
    }

    /// One past the last covered address.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.begin + self.len
    }

    #[inline]
    fn index(&self, addr: usize) -> usize {
        assert!(
            addr >= self.begin && addr < self.begin + self.len,
            "address {addr:#x} is not covered by the card table"
        );
        (addr - self.begin) >> CARD_SHIFT
    }

    /// First address covered by the card containing `addr`.
    #[inline]
    #[must_use]
    pub const fn card_start(addr: usize) -> usize {
        addr & !(CARD_SIZE - 1)
    }

    /// The write barrier: marks the card covering `addr` dirty.
    ///
    /// A single unconditional store, no lock.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the table.
    #[inline]
    pub fn mark_card(&self, addr: usize) {
        self.cards[self.index(addr)].store(CARD_DIRTY, Ordering::Release);
    }

    /// Current value of the card covering `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the table.
    #[inline]
    #[must_use]
    pub fn get(&self, addr: usize) -> u8 {
        self.cards[self.index(addr)].load(Ordering::Acquire)
    }

    /// Whether the card covering `addr` is dirty.
    #[must_use]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.get(addr) == CARD_DIRTY
    }

    fn card_range(&self, begin: usize, end: usize) -> std::ops::Range<usize> {
        let begin = begin.max(self.begin);
        let end = end.min(self.end());
        if begin >= end {
            return 0..0;
        }
        self.index(begin)..self.index(end - 1) + 1
    }

    /// Applies `modifier` to every card in `[begin, end)` with a CAS loop, so
    /// a concurrent `mark_card` is never lost: either the barrier's dirty
    /// value is the one modified, or it lands after the CAS.
    ///
    /// `on_change(card_addr, old, new)` runs for every card whose value changed.
    pub fn modify_cards_atomic(
        &self,
        begin: usize,
        end: usize,
        modifier: impl Fn(u8) -> u8,
        mut on_change: impl FnMut(usize, u8, u8),
    ) {
        for index in self.card_range(begin, end) {
            let card = &self.cards[index];
            let mut current = card.load(Ordering::Acquire);
            loop {
                let new = modifier(current);
                if new == current {
                    break;
                }
                match card.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        on_change(self.begin + (index << CARD_SHIFT), current, new);
                        break;
                    }
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Ages every card in `[begin, end)`.
    pub fn age_cards(&self, begin: usize, end: usize) {
        self.modify_cards_atomic(begin, end, age_card, |_, _, _| {});
    }

    /// Cleans every card in `[begin, end)` with plain stores.
    ///
    /// Only safe when no barrier can race, or when losing a racing dirty value
    /// is covered by a later root checkpoint.
    pub fn clear_cards(&self, begin: usize, end: usize) {
        for index in self.card_range(begin, end) {
            self.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Visits every object in `bitmap` that starts on a card in `[begin, end)`
    /// whose value is at least `minimum_age`. Returns the number of such cards.
    pub fn scan(
        &self,
        bitmap: &HeapBitmap,
        begin: usize,
        end: usize,
        minimum_age: u8,
        mut visitor: impl FnMut(ObjectRef),
    ) -> usize {
        let mut scanned = 0;
        for index in self.card_range(begin, end) {
            if self.cards[index].load(Ordering::Acquire) < minimum_age {
                continue;
            }
            let card_begin = self.begin + (index << CARD_SHIFT);
            bitmap.visit_marked_range(card_begin.max(begin), (card_begin + CARD_SIZE).min(end), &mut visitor);
            scanned += 1;
        }
        scanned
    }

    /// Number of cards in `[begin, end)` whose value is at least `minimum_age`.
    #[must_use]
    pub fn count_cards(&self, begin: usize, end: usize, minimum_age: u8) -> usize {
        self.card_range(begin, end)
            .filter(|&index| self.cards[index].load(Ordering::Relaxed) >= minimum_age)
            .count()
    }
}

impl std::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTable")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x40_0000;

    #[test]
    fn test_mark_card_dirties_covering_card() {
        let table = CardTable::new(BASE, 1 << 16);
        table.mark_card(BASE + 130);
        assert!(table.is_dirty(BASE + CARD_SIZE));
        assert!(table.is_dirty(BASE + 2 * CARD_SIZE - 1));
        assert!(!table.is_dirty(BASE));
    }

    #[test]
    fn test_aging_sequence() {
        assert_eq!(age_card(CARD_DIRTY), CARD_AGED);
        assert_eq!(age_card(CARD_AGED), CARD_CLEAN);
        assert_eq!(age_card(CARD_CLEAN), CARD_CLEAN);

        let table = CardTable::new(BASE, 1 << 12);
        table.mark_card(BASE);
        table.age_cards(BASE, BASE + (1 << 12));
        assert_eq!(table.get(BASE), CARD_AGED);
        table.age_cards(BASE, BASE + (1 << 12));
        assert_eq!(table.get(BASE), CARD_CLEAN);
    }

    #[test]
    fn test_modify_reports_changed_cards() {
        let table = CardTable::new(BASE, 1 << 12);
        table.mark_card(BASE + 3 * CARD_SIZE);
        table.mark_card(BASE + 5 * CARD_SIZE);
        let mut changed = Vec::new();
        table.modify_cards_atomic(BASE, BASE + (1 << 12), age_card, |addr, old, new| {
            changed.push((addr - BASE, old, new));
        });
        assert_eq!(
            changed,
            vec![
                (3 * CARD_SIZE, CARD_DIRTY, CARD_AGED),
                (5 * CARD_SIZE, CARD_DIRTY, CARD_AGED)
            ]
        );
    }

    #[test]
    fn test_scan_visits_objects_on_old_enough_cards() {
        let table = CardTable::new(BASE, 1 << 12);
        let bitmap = HeapBitmap::new("scan", BASE, 1 << 12);
        for card in 0..8 {
            bitmap.set(ObjectRef::new(BASE + card * CARD_SIZE + 16).unwrap());
        }
        table.mark_card(BASE + 2 * CARD_SIZE);
        table.mark_card(BASE + 6 * CARD_SIZE);
        table.age_cards(BASE, BASE + (1 << 12));
        table.mark_card(BASE + 4 * CARD_SIZE);

        let mut dirty_only = Vec::new();
        let n = table.scan(&bitmap, BASE, BASE + (1 << 12), CARD_DIRTY, |o| dirty_only.push(o));
        assert_eq!(n, 1);
        assert_eq!(dirty_only, vec![ObjectRef::new(BASE + 4 * CARD_SIZE + 16).unwrap()]);

        let mut aged_or_dirty = Vec::new();
        let n = table.scan(&bitmap, BASE, BASE + (1 << 12), CARD_AGED, |o| aged_or_dirty.push(o));
        assert_eq!(n, 3);
        assert_eq!(aged_or_dirty.len(), 3);
    }

    #[test]
    fn test_clear_cards_and_count() {
        let table = CardTable::new(BASE, 1 << 12);
        for card in 0..10 {
            table.mark_card(BASE + card * CARD_SIZE);
        }
        assert_eq!(table.count_cards(BASE, BASE + (1 << 12), CARD_DIRTY), 10);
        table.clear_cards(BASE, BASE + 5 * CARD_SIZE);
        assert_eq!(table.count_cards(BASE, BASE + (1 << 12), CARD_DIRTY), 5);
    }

    #[test]
    #[should_panic(expected = "not covered")]
    fn test_mark_outside_table_panics() {
        let table = CardTable::new(BASE, 1 << 12);
        table.mark_card(BASE + (1 << 12));
    }
}
