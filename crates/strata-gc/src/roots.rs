//! Root tables.
//!
//! Each mutator owns a table of root handles, and the heap owns one more
//! for global roots. A handle is an index into the table; released indices
//! are reused.

use crate::object::ObjectRef;

/// A handle to a root slot.
///
/// Handles are only meaningful for the table that issued them: a mutator
/// handle for that mutator, a global handle for the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

impl RootHandle {
    /// Index of the slot in its table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A set of root slots. Slots may hold null.
#[derive(Debug, Default)]
pub struct RootTable {
    slots: Vec<Option<ObjectRef>>,
    in_use: Vec<bool>,
    free: Vec<usize>,
}

impl RootTable {
    /// Create an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            in_use: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Register a new root holding `value`.
    pub fn add(&mut self, value: Option<ObjectRef>) -> RootHandle {
        if let Some(index) = self.free.pop() {
            self.slots[index] = value;
            self.in_use[index] = true;
            return RootHandle(index);
        }
        self.slots.push(value);
        self.in_use.push(true);
        RootHandle(self.slots.len() - 1)
    }

    fn check(&self, handle: RootHandle) {
        assert!(
            self.in_use.get(handle.0).copied().unwrap_or(false),
            "root handle {} is not registered",
            handle.0
        );
    }

    /// Current value of a root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was released or never issued by this table.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Option<ObjectRef> {
        self.check(handle);
        self.slots[handle.0]
    }

    /// Overwrite a root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was released or never issued by this table.
    pub fn set(&mut self, handle: RootHandle, value: Option<ObjectRef>) {
        self.check(handle);
        self.slots[handle.0] = value;
    }

    /// Unregister a root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was released or never issued by this table.
    pub fn remove(&mut self, handle: RootHandle) {
        self.check(handle);
        self.slots[handle.0] = None;
        self.in_use[handle.0] = false;
        self.free.push(handle.0);
    }

    /// Number of registered roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Check if there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all non-null roots.
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }

    /// Visit every non-null root mutably, so moved objects can be rewritten.
    pub fn visit_mut(&mut self, mut visitor: impl FnMut(&mut ObjectRef)) {
        for root in self.slots.iter_mut().flatten() {
            visitor(root);
        }
    }
}
