//! The narrow interface between the collector and the runtime's object layout.
//!
//! The collector never reads object memory directly. Sizes, reference fields
//! and the special fields of reference objects are all obtained through
//! [`ObjectModel`], which the embedding runtime implements once for its
//! header format.

use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every object start address, in bytes.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Rounds `bytes` up to [`OBJECT_ALIGNMENT`].
#[inline]
#[must_use]
pub const fn align_object_size(bytes: usize) -> usize {
    (bytes + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// The address of a managed object.
///
/// Never null. An `ObjectRef` held outside a root (a [`crate::RootHandle`],
/// global root, or a slot of another object) is only valid until the owning
/// thread's next safepoint, because compaction may move the object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wraps a raw address. Returns `None` for 0.
    #[inline]
    #[must_use]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns the raw address.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Returns a raw pointer to the first byte of the object.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.get() as *mut u8
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// A word-sized reference field inside a managed object.
///
/// Loads are `Acquire` and stores are `Release`, so a reference published
/// through a slot also publishes the initialized object behind it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(NonNull<AtomicUsize>);

// SAFETY: a slot is an address of an atomic word inside the heap reservation.
unsafe impl Send for Slot {}
// SAFETY: all accesses go through the atomic.
unsafe impl Sync for Slot {}

impl Slot {
    /// Creates a slot from the address of a reference field.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, 8-byte aligned and point to a word that stays
    /// valid for as long as the slot is used.
    #[inline]
    #[must_use]
    pub const unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: caller guarantees non-null.
        Self(unsafe { NonNull::new_unchecked(addr as *mut AtomicUsize) })
    }

    /// Returns the address of the field.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Loads the referenced object, or `None` for a null field.
    #[inline]
    #[must_use]
    pub fn load(self) -> Option<ObjectRef> {
        // SAFETY: validity was promised at construction.
        ObjectRef::new(unsafe { self.0.as_ref() }.load(Ordering::Acquire))
    }

    /// Stores `value` into the field.
    ///
    /// This is the raw store; mutators go through
    /// [`crate::Heap::write_reference`] so the card is dirtied.
    #[inline]
    pub fn store(self, value: Option<ObjectRef>) {
        // SAFETY: validity was promised at construction.
        unsafe { self.0.as_ref() }.store(value.map_or(0, ObjectRef::addr), Ordering::Release);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({:#x})", self.addr())
    }
}

/// The strength of a reference object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Not a reference object.
    None,
    /// Cleared when memory is needed.
    Soft,
    /// Cleared as soon as the referent is otherwise unreachable.
    Weak,
    /// Keeps its referent alive for one more cycle so it can be finalized.
    Finalizer,
    /// Cleared after finalization; the referent is never observable.
    Phantom,
}

/// How the marker scans an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// No reference fields.
    Scalar,
    /// An array whose elements may be references.
    Array,
    /// An ordinary object with reference fields.
    Container,
    /// A reference object; its referent is delayed instead of marked.
    Reference(ReferenceKind),
}

impl ObjectKind {
    /// The reference strength, `ReferenceKind::None` for other kinds.
    #[must_use]
    pub const fn reference_kind(self) -> ReferenceKind {
        match self {
            Self::Reference(kind) => kind,
            _ => ReferenceKind::None,
        }
    }
}

/// Callbacks the collector needs from the runtime's object layout.
///
/// All methods may be called from collector threads while mutators run, so
/// they must only read header words that are immutable after allocation and
/// must access reference fields through [`Slot`].
pub trait ObjectModel: Send + Sync {
    /// Total size of `obj` in bytes, including its header.
    fn size_of(&self, obj: ObjectRef) -> usize;

    /// The scanning category of `obj`.
    fn classify(&self, obj: ObjectRef) -> ObjectKind;

    /// Visits every reference field of `obj` exactly once.
    ///
    /// For reference objects this includes the referent and the zombie slot
    /// but never the pending-next link, which belongs to the collector.
    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn FnMut(Slot));

    /// The referent field of a reference object.
    fn referent_slot(&self, reference: ObjectRef) -> Slot;

    /// The collector-private queue link of a reference object.
    fn pending_next_slot(&self, reference: ObjectRef) -> Slot;

    /// Where a finalizer reference keeps its referent after it is enqueued.
    fn zombie_slot(&self, reference: ObjectRef) -> Slot;

    /// Whether the reference object was registered with a queue.
    fn has_queue(&self, reference: ObjectRef) -> bool;

    /// Header sanity check run before an object is marked.
    fn is_valid(&self, _obj: ObjectRef) -> bool {
        true
    }

    /// Visits roots owned by the runtime (class statics, interned strings, ...).
    ///
    /// The visitor may rewrite the root when its target moves.
    fn visit_roots(&self, _visitor: &mut dyn FnMut(&mut ObjectRef)) {}

    /// Reference strength of `obj`.
    fn reference_kind(&self, obj: ObjectRef) -> ReferenceKind {
        self.classify(obj).reference_kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_rejects_null() {
        assert!(ObjectRef::new(0).is_none());
        assert_eq!(ObjectRef::new(0x1000).map(ObjectRef::addr), Some(0x1000));
    }

    #[test]
    fn test_slot_round_trip() {
        let word = AtomicUsize::new(0);
        let slot = unsafe { Slot::from_addr(std::ptr::from_ref(&word) as usize) };
        assert_eq!(slot.load(), None);
        let target = ObjectRef::new(0x4000).unwrap();
        slot.store(Some(target));
        assert_eq!(slot.load(), Some(target));
        slot.store(None);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_align_object_size() {
        assert_eq!(align_object_size(1), 8);
        assert_eq!(align_object_size(8), 8);
        assert_eq!(align_object_size(17), 24);
    }
}
