//! Gray-object stack for serial marking.

use crate::object::ObjectRef;

/// Default initial capacity, in entries.
pub const DEFAULT_MARK_STACK_CAPACITY: usize = 64 * 1024;

/// Growable stack of marked-but-unscanned objects.
///
/// Lives inside the heap behind the mark-stack lock; a push on a full stack
/// doubles the capacity while that lock is held, so work is never dropped.
/// Entries are [`ObjectRef`]s and therefore never null.
#[derive(Debug)]
pub struct MarkStack {
    entries: Vec<ObjectRef>,
    capacity: usize,
    resizes: usize,
}

impl MarkStack {
    /// Creates an empty stack with room for `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            resizes: 0,
        }
    }

    /// Pushes a gray object, doubling capacity first if full.
    #[inline]
    pub fn push(&mut self, obj: ObjectRef) {
        if self.entries.len() == self.capacity {
            self.grow();
        }
        self.entries.push(obj);
    }

    #[cold]
    fn grow(&mut self) {
        let new_capacity = self.capacity * 2;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            old_capacity = self.capacity,
            new_capacity,
            "mark_stack_resize"
        );
        self.entries.reserve_exact(new_capacity - self.entries.len());
        self.capacity = new_capacity;
        self.resizes += 1;
    }

    /// Pops the most recently pushed object.
    #[inline]
    pub fn pop(&mut self) -> Option<ObjectRef> {
        self.entries.pop()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack is empty, i.e. the current pass may terminate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Times the stack has doubled since creation.
    #[must_use]
    pub const fn resizes(&self) -> usize {
        self.resizes
    }

    /// Empties the stack for the next cycle. Capacity is kept.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Removes and returns every entry, leaving the stack empty.
    pub fn take_all(&mut self) -> Vec<ObjectRef> {
        std::mem::replace(&mut self.entries, Vec::with_capacity(self.capacity))
    }
}

impl Default for MarkStack {
    fn default() -> Self {
        Self::new(DEFAULT_MARK_STACK_CAPACITY)
    }
}
