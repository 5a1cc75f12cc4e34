//! A ready-made object layout.
//!
//! Every object is a header word, then its reference fields, then raw
//! payload bytes:
//!
//! ```text
//! | magic:8 | flags:4 | kind:4 | refs:16 | size in words:32 |  refs...  | payload... |
//! ```
//!
//! Reference objects always start with three reference fields: referent,
//! pending-next and zombie. Pending-next belongs to the collector and is not
//! reported by [`ObjectModel::visit_references`].
//!
//! Used by the crate's own tests and benches, and usable by embedders that
//! do not need a layout of their own.
//!
//! ```
//! use std::sync::Arc;
//! use strata_gc::simple::SimpleObjectModel;
//! use strata_gc::{Heap, HeapConfig, ObjectKind, SpaceId};
//!
//! let model = Arc::new(SimpleObjectModel::new());
//! let heap = Heap::new(HeapConfig::default(), model.clone()).unwrap();
//! let mut mutator = heap.attach_mutator("main");
//! let node = model
//!     .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Container, 1, 16)
//!     .unwrap();
//! let root = mutator.new_root(Some(node));
//! assert_eq!(model.get_field(node, 0), None);
//! # mutator.release_root(root);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::mutator::Mutator;
use crate::object::{align_object_size, ObjectKind, ObjectModel, ObjectRef, ReferenceKind, Slot};
use crate::space::SpaceId;

/// Bytes taken by the header.
pub const HEADER_SIZE: usize = 8;
/// Bytes taken by one reference field.
pub const FIELD_SIZE: usize = 8;
/// Reference fields every reference object starts with.
pub const REFERENCE_FIELDS: usize = 3;

const REFERENT: usize = 0;
const PENDING_NEXT: usize = 1;
const ZOMBIE: usize = 2;

const MAGIC: u64 = 0xA5;
const MAGIC_SHIFT: u32 = 56;
const HAS_QUEUE: u64 = 1 << 52;
const KIND_SHIFT: u32 = 48;
const REFS_SHIFT: u32 = 32;

const fn kind_tag(kind: ObjectKind) -> u64 {
    match kind {
        ObjectKind::Scalar => 0,
        ObjectKind::Array => 1,
        ObjectKind::Container => 2,
        ObjectKind::Reference(ReferenceKind::Soft) => 3,
        ObjectKind::Reference(ReferenceKind::Weak) => 4,
        ObjectKind::Reference(ReferenceKind::Finalizer) => 5,
        ObjectKind::Reference(ReferenceKind::Phantom) => 6,
        ObjectKind::Reference(ReferenceKind::None) => 7,
    }
}

const fn tag_kind(tag: u64) -> Option<ObjectKind> {
    Some(match tag {
        0 => ObjectKind::Scalar,
        1 => ObjectKind::Array,
        2 => ObjectKind::Container,
        3 => ObjectKind::Reference(ReferenceKind::Soft),
        4 => ObjectKind::Reference(ReferenceKind::Weak),
        5 => ObjectKind::Reference(ReferenceKind::Finalizer),
        6 => ObjectKind::Reference(ReferenceKind::Phantom),
        _ => return None,
    })
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header(u64);

impl Header {
    fn encode(kind: ObjectKind, num_refs: usize, size: usize, has_queue: bool) -> Self {
        let num_refs = u64::try_from(num_refs)
            .ok()
            .filter(|&refs| refs <= u64::from(u16::MAX))
            .unwrap_or_else(|| panic!("{num_refs} reference fields do not fit the header"));
        let words = u64::try_from(size / FIELD_SIZE)
            .ok()
            .filter(|&words| words <= u64::from(u32::MAX))
            .unwrap_or_else(|| panic!("object of {size} bytes does not fit the header"));
        let mut word = (MAGIC << MAGIC_SHIFT) | (kind_tag(kind) << KIND_SHIFT) | (num_refs << REFS_SHIFT) | words;
        if has_queue {
            word |= HAS_QUEUE;
        }
        Self(word)
    }

    const fn magic(self) -> u64 {
        self.0 >> MAGIC_SHIFT
    }

    fn kind(self) -> Option<ObjectKind> {
        tag_kind((self.0 >> KIND_SHIFT) & 0xF)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn num_refs(self) -> usize {
        ((self.0 >> REFS_SHIFT) & 0xFFFF) as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn size(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize * FIELD_SIZE
    }

    const fn has_queue(self) -> bool {
        self.0 & HAS_QUEUE != 0
    }
}

/// The layout described in the [module docs](self).
#[derive(Debug, Default)]
pub struct SimpleObjectModel {
    vm_roots: Mutex<Vec<Option<ObjectRef>>>,
}

impl SimpleObjectModel {
    /// Creates a model with no runtime roots.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vm_roots: Mutex::new(Vec::new()),
        }
    }

    /// Bytes needed for an object with `num_refs` fields and
    /// `payload_bytes` of payload.
    #[must_use]
    pub const fn object_size(num_refs: usize, payload_bytes: usize) -> usize {
        align_object_size(HEADER_SIZE + num_refs * FIELD_SIZE + payload_bytes)
    }

    fn header(obj: ObjectRef) -> Header {
        // SAFETY: every object starts with an aligned header word.
        let word = unsafe { &*(obj.addr() as *const AtomicU64) };
        Header(word.load(Ordering::Acquire))
    }

    /// Writes the header of a freshly allocated object of
    /// [`object_size(num_refs, payload_bytes)`](Self::object_size) bytes.
    ///
    /// `obj` must be zeroed memory that nothing else references yet.
    ///
    /// # Panics
    ///
    /// Panics for `ObjectKind::Reference(ReferenceKind::None)` and for a
    /// reference object with fewer than [`REFERENCE_FIELDS`] fields.
    pub fn init_object(&self, obj: ObjectRef, kind: ObjectKind, num_refs: usize, payload_bytes: usize) {
        self.init(obj, kind, num_refs, payload_bytes, false);
    }

    fn init(&self, obj: ObjectRef, kind: ObjectKind, num_refs: usize, payload_bytes: usize, has_queue: bool) {
        if let ObjectKind::Reference(reference) = kind {
            assert!(reference != ReferenceKind::None, "reference objects need a strength");
            assert!(
                num_refs >= REFERENCE_FIELDS,
                "reference objects need at least {REFERENCE_FIELDS} fields"
            );
        }
        let header = Header::encode(kind, num_refs, Self::object_size(num_refs, payload_bytes), has_queue);
        // SAFETY: `obj` is the start of an allocation at least one word long.
        let word = unsafe { &*(obj.addr() as *const AtomicU64) };
        word.store(header.0, Ordering::Release);
    }

    /// Allocates and initializes an object.
    ///
    /// # Errors
    ///
    /// Propagates the allocation failure.
    pub fn alloc_object(
        &self,
        mutator: &mut Mutator,
        space: SpaceId,
        kind: ObjectKind,
        num_refs: usize,
        payload_bytes: usize,
    ) -> Result<ObjectRef, AllocError> {
        let obj = mutator.allocate(space, Self::object_size(num_refs, payload_bytes))?;
        self.init_object(obj, kind, num_refs, payload_bytes);
        Ok(obj)
    }

    /// Allocates a reference object with a null referent.
    ///
    /// `has_queue` marks it for the cleared queue once its referent is
    /// cleared.
    ///
    /// # Errors
    ///
    /// Propagates the allocation failure.
    ///
    /// # Panics
    ///
    /// Panics for `ReferenceKind::None`.
    pub fn alloc_reference(
        &self,
        mutator: &mut Mutator,
        space: SpaceId,
        kind: ReferenceKind,
        has_queue: bool,
    ) -> Result<ObjectRef, AllocError> {
        assert!(kind != ReferenceKind::None, "reference objects need a strength");
        let obj = mutator.allocate(space, Self::object_size(REFERENCE_FIELDS, 0))?;
        self.init(obj, ObjectKind::Reference(kind), REFERENCE_FIELDS, 0, has_queue);
        Ok(obj)
    }

    /// Number of reference fields of `obj`.
    #[must_use]
    pub fn num_refs(&self, obj: ObjectRef) -> usize {
        Self::header(obj).num_refs()
    }

    /// Reference field `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` has no such field.
    #[must_use]
    pub fn field(&self, obj: ObjectRef, index: usize) -> Slot {
        let refs = self.num_refs(obj);
        assert!(index < refs, "field {index} out of range for {obj:?} with {refs} fields");
        // SAFETY: the field lies inside the object.
        unsafe { Slot::from_addr(obj.addr() + HEADER_SIZE + index * FIELD_SIZE) }
    }

    /// Reads reference field `index`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` has no such field.
    #[must_use]
    pub fn get_field(&self, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
        self.field(obj, index).load()
    }

    /// Writes reference field `index` through the write barrier.
    ///
    /// # Panics
    ///
    /// Panics if `obj` has no such field.
    pub fn set_field(&self, mutator: &Mutator, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        mutator.write_reference(obj, self.field(obj, index), value);
    }

    /// Sets the referent of a reference object.
    pub fn set_referent(&self, mutator: &Mutator, reference: ObjectRef, value: Option<ObjectRef>) {
        self.set_field(mutator, reference, REFERENT, value);
    }

    fn payload_range(obj: ObjectRef) -> (usize, usize) {
        let header = Self::header(obj);
        let start = obj.addr() + HEADER_SIZE + header.num_refs() * FIELD_SIZE;
        (start, obj.addr() + header.size())
    }

    /// Copies `bytes` to the start of the payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload is shorter than `bytes`.
    pub fn write_payload(&self, obj: ObjectRef, bytes: &[u8]) {
        let (start, end) = Self::payload_range(obj);
        assert!(bytes.len() <= end - start, "payload of {obj:?} holds {} bytes", end - start);
        // SAFETY: the range lies inside the object's payload.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), start as *mut u8, bytes.len()) };
    }

    /// Copies the payload out, including any alignment padding.
    #[must_use]
    pub fn read_payload(&self, obj: ObjectRef) -> Vec<u8> {
        let (start, end) = Self::payload_range(obj);
        // SAFETY: the range lies inside the object's payload.
        unsafe { std::slice::from_raw_parts(start as *const u8, end - start) }.to_vec()
    }

    /// Adds a runtime root and returns its index.
    pub fn add_vm_root(&self, value: Option<ObjectRef>) -> usize {
        let mut roots = self.vm_roots.lock();
        roots.push(value);
        roots.len() - 1
    }

    /// Current value of runtime root `index`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such root.
    #[must_use]
    pub fn vm_root(&self, index: usize) -> Option<ObjectRef> {
        self.vm_roots.lock()[index]
    }

    /// Overwrites runtime root `index`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such root.
    pub fn set_vm_root(&self, index: usize, value: Option<ObjectRef>) {
        self.vm_roots.lock()[index] = value;
    }
}

impl ObjectModel for SimpleObjectModel {
    fn size_of(&self, obj: ObjectRef) -> usize {
        Self::header(obj).size().max(HEADER_SIZE)
    }

    fn classify(&self, obj: ObjectRef) -> ObjectKind {
        Self::header(obj).kind().unwrap_or(ObjectKind::Scalar)
    }

    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn FnMut(Slot)) {
        let header = Self::header(obj);
        let is_reference = matches!(header.kind(), Some(ObjectKind::Reference(_)));
        for index in 0..header.num_refs() {
            if is_reference && index == PENDING_NEXT {
                continue;
            }
            // SAFETY: the field lies inside the object.
            visitor(unsafe { Slot::from_addr(obj.addr() + HEADER_SIZE + index * FIELD_SIZE) });
        }
    }

    fn referent_slot(&self, reference: ObjectRef) -> Slot {
        self.field(reference, REFERENT)
    }

    fn pending_next_slot(&self, reference: ObjectRef) -> Slot {
        self.field(reference, PENDING_NEXT)
    }

    fn zombie_slot(&self, reference: ObjectRef) -> Slot {
        self.field(reference, ZOMBIE)
    }

    fn has_queue(&self, reference: ObjectRef) -> bool {
        Self::header(reference).has_queue()
    }

    fn is_valid(&self, obj: ObjectRef) -> bool {
        let header = Self::header(obj);
        header.magic() == MAGIC
            && header.kind().is_some()
            && header.size() >= HEADER_SIZE + header.num_refs() * FIELD_SIZE
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        for root in self.vm_roots.lock().iter_mut().flatten() {
            visitor(root);
        }
    }
}
