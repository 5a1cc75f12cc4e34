//! # Lock Ordering Discipline
//!
//! Every lock in a [`Heap`](crate::Heap) has a level. A thread may only
//! acquire a lock whose level is greater than or equal to the highest level
//! it already holds.
//!
//! | Level | Lock                  | Guards                                        |
//! |-------|-----------------------|-----------------------------------------------|
//! | 1     | `GcCycle`             | one collection at a time                      |
//! | 2     | `ThreadList`          | mutator registry, suspension, checkpoints     |
//! | 3     | `MutatorState`        | a mutator's root table and TLAB               |
//! | 4     | `HeapBitmap`          | live/mark role swap (shared for marking)      |
//! | 5     | `MarkStack`           | the serial gray stack and its resize          |
//! | 6     | `ReferenceProcessor`  | slow-path flag and preserve mode              |
//! | 7     | `ReferenceQueue`      | one reference queue; never nested             |
//! | 8     | `SpaceAllocator`      | free lists, region table, mod-union cache     |
//!
//! Reference queue locks are independent and must never be held together:
//! each queue operation releases its lock before the next queue's lock is
//! taken.
//!
//! ## Validation
//!
//! In debug builds every acquisition made through [`ordered`] or
//! [`LockGuard::new`] is checked against a per-thread stack of held levels.
//!
//! ```
//! use strata_gc::gc::sync::{LockGuard, LockOrder};
//!
//! let _threads = LockGuard::new(LockOrder::ThreadList);
//! let _bitmaps = LockGuard::new(LockOrder::HeapBitmap);
//! ```

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<LockOrder>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock tags, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// Serializes collections on one heap.
    GcCycle = 1,
    /// Mutator registry and suspend/checkpoint state.
    ThreadList = 2,
    /// A single mutator's roots and TLAB.
    MutatorState = 3,
    /// The heap-wide bitmap role lock.
    HeapBitmap = 4,
    /// The serial mark stack.
    MarkStack = 5,
    /// Reference processor state.
    ReferenceProcessor = 6,
    /// One of the reference queues.
    ReferenceQueue = 7,
    /// Allocator state of a space.
    SpaceAllocator = 8,
}

impl LockOrder {
    /// Numeric level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    /// Whether two locks of this kind may be held at once.
    #[must_use]
    pub const fn allows_nesting(self) -> bool {
        !matches!(self, Self::ReferenceQueue)
    }
}

/// Records a lock acquisition for validation; pops it on drop.
#[must_use]
pub struct LockGuard {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    tag: LockOrder,
}

impl LockGuard {
    /// Validates acquiring `tag` against the locks this thread holds.
    ///
    /// # Panics
    ///
    /// Panics in debug builds with "Lock ordering violation" when `tag` is
    /// below a held level, or is a second reference queue lock.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            if let Some(held) = highest_held() {
                validate_lock_order(tag, held);
            }
            push_held(tag);
        }
        Self { tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                let mut stack = state.stack.borrow_mut();
                if let Some(pos) = stack.iter().rposition(|held| *held == self.tag) {
                    stack.remove(pos);
                }
            }
        });
    }
}

/// A lock guard paired with its ordering record.
///
/// Field order drops the real guard before the record.
pub struct Ordered<G> {
    guard: G,
    _order: LockGuard,
}

impl<G> Deref for Ordered<G> {
    type Target = G;

    fn deref(&self) -> &G {
        &self.guard
    }
}

impl<G> DerefMut for Ordered<G> {
    fn deref_mut(&mut self) -> &mut G {
        &mut self.guard
    }
}

/// Validates `tag`, then runs `acquire` and ties the result to the record.
#[inline]
pub fn ordered<G>(tag: LockOrder, acquire: impl FnOnce() -> G) -> Ordered<G> {
    let order = LockGuard::new(tag);
    Ordered {
        guard: acquire(),
        _order: order,
    }
}

/// Disables tracking for the current thread during TLS teardown.
#[inline]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| state.is_shutdown.set(true));
    }
}

#[cfg(debug_assertions)]
fn push_held(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if !state.is_shutdown.get() {
            state.stack.borrow_mut().push(tag);
        }
    });
}

/// Highest lock level currently held by this thread.
#[must_use]
pub fn highest_held() -> Option<LockOrder> {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return None;
            }
            state.stack.borrow().iter().copied().max()
        })
        .ok()
        .flatten()
}

/// Checks that `tag` may be acquired while `held` is the highest held lock.
///
/// # Panics
///
/// Panics in debug builds on a violation.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, held: LockOrder) {
    debug_assert!(
        tag >= held,
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding {held:?} (level {})",
        tag.level(),
        held.level()
    );
    debug_assert!(
        tag != held || tag.allows_nesting(),
        "Lock ordering violation: {tag:?} locks must not be nested"
    );
}

/// No-op in release builds.
#[inline]
#[cfg(not(debug_assertions))]
pub const fn validate_lock_order(_tag: LockOrder, _held: LockOrder) {}

#[cfg(test)]
mod tests {
    use super::{highest_held, LockGuard, LockOrder};

    #[test]
    fn test_levels_follow_declaration_order() {
        assert!(LockOrder::GcCycle.level() < LockOrder::ThreadList.level());
        assert!(LockOrder::HeapBitmap.level() < LockOrder::ReferenceProcessor.level());
        assert!(LockOrder::ReferenceQueue.level() < LockOrder::SpaceAllocator.level());
    }

    #[test]
    fn test_collector_order_is_valid() {
        let _cycle = LockGuard::new(LockOrder::GcCycle);
        let _threads = LockGuard::new(LockOrder::ThreadList);
        let _mutator = LockGuard::new(LockOrder::MutatorState);
        let _bitmap = LockGuard::new(LockOrder::HeapBitmap);
        let _stack = LockGuard::new(LockOrder::MarkStack);
        let _queue = LockGuard::new(LockOrder::ReferenceQueue);
        let _alloc = LockGuard::new(LockOrder::SpaceAllocator);
        assert_eq!(highest_held(), Some(LockOrder::SpaceAllocator));
    }

    #[test]
    fn test_same_level_allocator_locks_nest() {
        let _a = LockGuard::new(LockOrder::SpaceAllocator);
        let _b = LockGuard::new(LockOrder::SpaceAllocator);
    }

    #[test]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_inverted_order_panics() {
        let _bitmap = LockGuard::new(LockOrder::HeapBitmap);
        let _threads = LockGuard::new(LockOrder::ThreadList);
    }

    #[test]
    #[should_panic(expected = "must not be nested")]
    fn test_nested_reference_queues_panic() {
        let _soft = LockGuard::new(LockOrder::ReferenceQueue);
        let _weak = LockGuard::new(LockOrder::ReferenceQueue);
    }

    #[test]
    fn test_sequential_reference_queues_are_fine() {
        {
            let _soft = LockGuard::new(LockOrder::ReferenceQueue);
        }
        let _weak = LockGuard::new(LockOrder::ReferenceQueue);
    }

    #[test]
    fn test_state_restored_after_drop() {
        {
            let _bitmap = LockGuard::new(LockOrder::HeapBitmap);
            let _alloc = LockGuard::new(LockOrder::SpaceAllocator);
        }
        assert_eq!(highest_held(), None);
        let _threads = LockGuard::new(LockOrder::ThreadList);
    }

    #[test]
    fn test_out_of_order_drop_keeps_remaining_levels() {
        let threads = LockGuard::new(LockOrder::ThreadList);
        let bitmap = LockGuard::new(LockOrder::HeapBitmap);
        drop(threads);
        assert_eq!(highest_held(), Some(LockOrder::HeapBitmap));
        drop(bitmap);
        assert_eq!(highest_held(), None);
    }
}
