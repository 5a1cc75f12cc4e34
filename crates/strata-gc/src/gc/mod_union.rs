//! Mod-union table for an immune space.
//!
//! Immune spaces are never marked or swept, but their objects may reference
//! collectible objects. Instead of rescanning the whole space every cycle,
//! the table remembers which cards were dirtied since they were last looked
//! at and caches, per card, the slots that point into collectible spaces.
//! Each cycle only the newly dirtied cards are rescanned; every cached slot
//! acts as a root.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::gc::card_table::{age_card, CardTable, CARD_DIRTY, CARD_SIZE};
use crate::gc::mark::HeapBitmap;
use crate::gc::sync::{ordered, LockOrder};
use crate::object::{ObjectModel, ObjectRef, Slot};

/// Cached immune-to-collectible references, keyed by card.
pub struct ModUnionTable {
    name: String,
    begin: usize,
    end: usize,
    /// Cards found dirty by `clear_cards` and not yet rescanned.
    cleared_cards: Mutex<BTreeSet<usize>>,
    references: Mutex<BTreeMap<usize, Vec<Slot>>>,
}

impl ModUnionTable {
    /// Creates an empty table for the space `[begin, end)`.
    #[must_use]
    pub fn new(name: &str, begin: usize, end: usize) -> Self {
        Self {
            name: format!("{name} mod-union table"),
            begin,
            end,
            cleared_cards: Mutex::new(BTreeSet::new()),
            references: Mutex::new(BTreeMap::new()),
        }
    }

    /// Table name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ages every card of the space and records the ones that were dirty.
    pub fn clear_cards(&self, cards: &CardTable) {
        let mut cleared = ordered(LockOrder::SpaceAllocator, || self.cleared_cards.lock());
        cards.modify_cards_atomic(self.begin, self.end, age_card, |card, old, _| {
            if old == CARD_DIRTY {
                cleared.insert(card);
            }
        });
    }

    /// Rescans the recorded cards through `live`, refreshes their cached
    /// slots, then hands every cached non-null collectible target to `mark`.
    ///
    /// Returns the number of cards rescanned. `mark` runs with no table lock
    /// held, so it may take the mark stack lock.
    pub fn update_and_mark_references(
        &self,
        live: &HeapBitmap,
        model: &dyn ObjectModel,
        is_collectible: impl Fn(ObjectRef) -> bool,
        mut mark: impl FnMut(ObjectRef),
    ) -> usize {
        let cleared = std::mem::take(&mut **ordered(LockOrder::SpaceAllocator, || {
            self.cleared_cards.lock()
        }));
        let targets: Vec<ObjectRef> = {
            let mut references = ordered(LockOrder::SpaceAllocator, || self.references.lock());
            for &card in &cleared {
                let mut slots = Vec::new();
                live.visit_marked_range(card, card + CARD_SIZE, |obj| {
                    model.visit_references(obj, &mut |slot| {
                        if slot.load().is_some_and(&is_collectible) {
                            slots.push(slot);
                        }
                    });
                });
                if slots.is_empty() {
                    references.remove(&card);
                } else {
                    references.insert(card, slots);
                }
            }
            references
                .values()
                .flatten()
                .filter_map(|slot| slot.load())
                .filter(|target| is_collectible(*target))
                .collect()
        };
        for target in targets {
            mark(target);
        }
        cleared.len()
    }

    /// Rewrites every cached slot whose target `forward` relocates.
    ///
    /// Returns the number of slots rewritten.
    pub fn update_references(&self, forward: impl Fn(ObjectRef) -> Option<ObjectRef>) -> usize {
        let references = ordered(LockOrder::SpaceAllocator, || self.references.lock());
        let mut updated = 0;
        for slot in references.values().flatten() {
            if let Some(new) = slot.load().and_then(&forward) {
                slot.store(Some(new));
                updated += 1;
            }
        }
        updated
    }

    /// Number of cards holding cached slots.
    #[must_use]
    pub fn cached_cards(&self) -> usize {
        self.references.lock().len()
    }

    /// Number of cached slots.
    #[must_use]
    pub fn cached_slots(&self) -> usize {
        self.references.lock().values().map(Vec::len).sum()
    }

    /// Number of cards recorded but not yet rescanned.
    #[must_use]
    pub fn pending_cards(&self) -> usize {
        self.cleared_cards.lock().len()
    }
}

impl std::fmt::Debug for ModUnionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModUnionTable")
            .field("name", &self.name)
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("end", &format_args!("{:#x}", self.end))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::card_table::{CARD_AGED, CARD_CLEAN};
    use crate::object::ObjectKind;

    /// Every object is two words: a header and one reference field.
    struct OneField;

    impl ObjectModel for OneField {
        fn size_of(&self, _: ObjectRef) -> usize {
            16
        }
        fn classify(&self, _: ObjectRef) -> ObjectKind {
            ObjectKind::Container
        }
        fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn FnMut(Slot)) {
            visitor(unsafe { Slot::from_addr(obj.addr() + 8) });
        }
        fn referent_slot(&self, _: ObjectRef) -> Slot {
            unreachable!()
        }
        fn pending_next_slot(&self, _: ObjectRef) -> Slot {
            unreachable!()
        }
        fn zombie_slot(&self, _: ObjectRef) -> Slot {
            unreachable!()
        }
        fn has_queue(&self, _: ObjectRef) -> bool {
            false
        }
    }

    struct Fixture {
        _memory: Box<[u64]>,
        base: usize,
        cards: CardTable,
        live: HeapBitmap,
    }

    /// An immune half `[base, base + 1024)` followed by a collectible half.
    fn fixture() -> Fixture {
        let mut words = vec![0u64; 2048 / 8 + 16].into_boxed_slice();
        let raw = words.as_mut_ptr() as usize;
        let base = (raw + 127) & !127;
        Fixture {
            cards: CardTable::new(base, 2048),
            live: HeapBitmap::new("immune live", base, 1024),
            _memory: words,
            base,
        }
    }

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::new(addr).unwrap()
    }

    #[test]
    fn test_dirty_card_is_rescanned_and_cached() {
        let f = fixture();
        let table = ModUnionTable::new("immune", f.base, f.base + 1024);
        let holder = obj(f.base + 256);
        let target = obj(f.base + 1024 + 64);
        f.live.set(holder);
        unsafe { Slot::from_addr(holder.addr() + 8) }.store(Some(target));
        f.cards.mark_card(holder.addr());

        table.clear_cards(&f.cards);
        assert_eq!(f.cards.get(holder.addr()), CARD_AGED);
        assert_eq!(table.pending_cards(), 1);

        let mut marked = Vec::new();
        let immune_end = f.base + 1024;
        let rescanned = table.update_and_mark_references(
            &f.live,
            &OneField,
            |t| t.addr() >= immune_end,
            |t| marked.push(t),
        );
        assert_eq!(rescanned, 1);
        assert_eq!(marked, vec![target]);
        assert_eq!(table.cached_slots(), 1);

        // Later cycles mark cached targets without the card being dirty.
        table.clear_cards(&f.cards);
        assert_eq!(f.cards.get(holder.addr()), CARD_CLEAN);
        marked.clear();
        table.update_and_mark_references(&f.live, &OneField, |t| t.addr() >= immune_end, |t| {
            marked.push(t);
        });
        assert_eq!(marked, vec![target]);
    }

    #[test]
    fn test_immune_targets_and_nulls_are_not_cached() {
        let f = fixture();
        let table = ModUnionTable::new("immune", f.base, f.base + 1024);
        let a = obj(f.base);
        let b = obj(f.base + 512);
        f.live.set(a);
        f.live.set(b);
        unsafe { Slot::from_addr(a.addr() + 8) }.store(Some(b));
        f.cards.mark_card(a.addr());
        f.cards.mark_card(b.addr());

        table.clear_cards(&f.cards);
        let immune_end = f.base + 1024;
        let mut marked = 0;
        table.update_and_mark_references(&f.live, &OneField, |t| t.addr() >= immune_end, |_| {
            marked += 1;
        });
        assert_eq!(marked, 0);
        assert_eq!(table.cached_cards(), 0);
    }

    #[test]
    fn test_update_references_rewrites_cached_slots() {
        let f = fixture();
        let table = ModUnionTable::new("immune", f.base, f.base + 1024);
        let holder = obj(f.base + 128);
        let old = obj(f.base + 1024 + 256);
        let new = obj(f.base + 1024 + 16);
        f.live.set(holder);
        let slot = unsafe { Slot::from_addr(holder.addr() + 8) };
        slot.store(Some(old));
        f.cards.mark_card(holder.addr());
        table.clear_cards(&f.cards);
        let immune_end = f.base + 1024;
        table.update_and_mark_references(&f.live, &OneField, |t| t.addr() >= immune_end, |_| {});

        let updated = table.update_references(|t| (t == old).then_some(new));
        assert_eq!(updated, 1);
        assert_eq!(slot.load(), Some(new));
    }
}
