//! Bump-pointer space.
//!
//! Memory is handed out as blocks by advancing an atomic cursor. Each block
//! starts with a [`BLOCK_HEADER_SIZE`]-byte header `{size, used}` so the space
//! stays walkable while thread-local buffers are only partially filled.
//! Objects are never freed individually; mark-compact slides survivors to
//! the start of the space and rewrites it as a single block.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sys_alloc::Mmap;

use crate::error::heap_corruption;
use crate::gc::mark::HeapBitmap;
use crate::object::{align_object_size, ObjectModel, ObjectRef};
use crate::space::{ContinuousSpace, GcRetentionPolicy, SpaceId};

/// Size of a block header: block size, then bytes used by objects.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Header words of the block at `block`.
///
/// # Safety
///
/// `block` must be the start of a block inside a live mapping.
unsafe fn block_header<'a>(block: usize) -> (&'a AtomicUsize, &'a AtomicUsize) {
    // SAFETY: the header is two aligned words at the block start.
    unsafe {
        (
            &*(block as *const AtomicUsize),
            &*((block + 8) as *const AtomicUsize),
        )
    }
}

/// A thread-local allocation buffer: one block owned by a single mutator.
#[derive(Debug)]
pub struct Tlab {
    block: usize,
    pos: usize,
    end: usize,
}

impl Tlab {
    /// Bump-allocates `bytes` (already object aligned) from the buffer.
    ///
    /// The block header's `used` word is republished on every allocation so
    /// the block can be walked whenever its owner is at a safepoint.
    #[inline]
    pub fn alloc(&mut self, bytes: usize) -> Option<ObjectRef> {
        if self.end - self.pos < bytes {
            return None;
        }
        let obj = self.pos;
        self.pos += bytes;
        // SAFETY: the block was created by `alloc_block` and outlives the TLAB.
        let (_, used) = unsafe { block_header(self.block) };
        used.store(self.pos - self.block - BLOCK_HEADER_SIZE, Ordering::Release);
        ObjectRef::new(obj)
    }

    /// Bytes left in the buffer.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.end - self.pos
    }

    /// Start of the buffer's block.
    #[must_use]
    pub const fn block(&self) -> usize {
        self.block
    }
}

/// A space that only bump-allocates.
pub struct BumpPointerSpace {
    name: String,
    id: SpaceId,
    policy: GcRetentionPolicy,
    begin: usize,
    limit: usize,
    end: AtomicUsize,
    mem: Arc<Mmap>,
    mark_bitmap: HeapBitmap,
    live_bitmap: Option<HeapBitmap>,
    objects_allocated: AtomicUsize,
    bytes_allocated: AtomicUsize,
}

impl BumpPointerSpace {
    /// Creates a space over `[begin, begin + capacity)` of `mem`.
    ///
    /// A `NeverCollect` space also keeps a live bitmap, which marking and
    /// card scanning use in place of the mark bitmap.
    #[must_use]
    pub fn new(
        name: &str,
        id: SpaceId,
        policy: GcRetentionPolicy,
        mem: Arc<Mmap>,
        begin: usize,
        capacity: usize,
    ) -> Self {
        debug_assert!(mem.contains_range(begin, capacity));
        let live_bitmap = (policy == GcRetentionPolicy::NeverCollect)
            .then(|| HeapBitmap::new(format!("{name} live bitmap"), begin, capacity));
        Self {
            name: name.to_owned(),
            id,
            policy,
            begin,
            limit: begin + capacity,
            end: AtomicUsize::new(begin),
            mem,
            mark_bitmap: HeapBitmap::new(format!("{name} mark bitmap"), begin, capacity),
            live_bitmap,
            objects_allocated: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
        }
    }

    /// Reserves a block of `size` bytes (header included) by bumping the cursor.
    fn alloc_block(&self, size: usize) -> Option<usize> {
        let mut current = self.end.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(size)?;
            if next > self.limit {
                return None;
            }
            match self
                .end
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // SAFETY: `[current, current + size)` now belongs to this caller.
        let (block_size, used) = unsafe { block_header(current) };
        block_size.store(size, Ordering::Relaxed);
        used.store(0, Ordering::Release);
        Some(current)
    }

    /// Allocates `bytes` in a block of its own.
    pub fn alloc(&self, bytes: usize) -> Option<ObjectRef> {
        let bytes = align_object_size(bytes);
        let block = self.alloc_block(BLOCK_HEADER_SIZE + bytes)?;
        // SAFETY: block was just created.
        let (_, used) = unsafe { block_header(block) };
        used.store(bytes, Ordering::Release);
        self.record_allocation(bytes);
        ObjectRef::new(block + BLOCK_HEADER_SIZE)
    }

    /// Creates a TLAB spanning a fresh block of `size` bytes.
    pub fn alloc_tlab(&self, size: usize) -> Option<Tlab> {
        let size = align_object_size(size.max(BLOCK_HEADER_SIZE * 2));
        let block = self.alloc_block(size)?;
        Some(Tlab {
            block,
            pos: block + BLOCK_HEADER_SIZE,
            end: block + size,
        })
    }

    /// Accounts an allocation made through a TLAB.
    #[inline]
    pub fn record_allocation(&self, bytes: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Visits every allocated object in address order.
    ///
    /// Requires that no block is being created concurrently, i.e. all
    /// mutators are suspended or the space is otherwise quiescent.
    ///
    /// # Panics
    ///
    /// Panics if a block header or object size is inconsistent.
    pub fn walk(&self, model: &dyn ObjectModel, mut visitor: impl FnMut(ObjectRef)) {
        let end = self.end.load(Ordering::Acquire);
        let mut block = self.begin;
        while block < end {
            // SAFETY: `block` is a block start below the cursor.
            let (size, used) = unsafe { block_header(block) };
            let size = size.load(Ordering::Relaxed);
            let used = used.load(Ordering::Acquire);
            if size < BLOCK_HEADER_SIZE || block + size > end || used > size - BLOCK_HEADER_SIZE {
                heap_corruption!("{}: bad block header at {block:#x}", self.name);
            }
            let mut pos = block + BLOCK_HEADER_SIZE;
            let objects_end = pos + used;
            while pos < objects_end {
                let Some(obj) = ObjectRef::new(pos) else { break };
                let obj_size = align_object_size(model.size_of(obj));
                if obj_size == 0 {
                    heap_corruption!("{}: zero-sized object at {pos:#x}", self.name);
                }
                visitor(obj);
                pos += obj_size;
            }
            block += size;
        }
    }

    /// Rewrites the space as one block holding `used` bytes of objects,
    /// after compaction slid `objects` survivors to the front.
    ///
    /// Returns the old end.
    pub(crate) fn reset_after_compaction(&self, used: usize, objects: usize) -> usize {
        let old_end = self.end.load(Ordering::Acquire);
        let new_end = if objects == 0 {
            self.begin
        } else {
            // SAFETY: the space holds at least the header.
            let (size, used_word) = unsafe { block_header(self.begin) };
            size.store(BLOCK_HEADER_SIZE + used, Ordering::Relaxed);
            used_word.store(used, Ordering::Release);
            self.begin + BLOCK_HEADER_SIZE + used
        };
        self.end.store(new_end, Ordering::Release);
        self.objects_allocated.store(objects, Ordering::Relaxed);
        self.bytes_allocated.store(used, Ordering::Relaxed);
        old_end
    }

    /// Zero-fills `[begin, end)` and releases its pages.
    pub(crate) fn release_range(&self, begin: usize, end: usize) {
        if end > begin {
            if let Err(err) = self.mem.discard(begin, end - begin) {
                heap_corruption!("{}: failed to release [{begin:#x}, {end:#x}): {err}", self.name);
            }
        }
    }

    /// Address the first object lands on when the space is compacted.
    #[must_use]
    pub const fn compaction_start(&self) -> usize {
        self.begin + BLOCK_HEADER_SIZE
    }
}

impl ContinuousSpace for BumpPointerSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> SpaceId {
        self.id
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        self.policy
    }

    fn mark_bitmap(&self) -> &HeapBitmap {
        &self.mark_bitmap
    }

    fn live_bitmap(&self) -> Option<&HeapBitmap> {
        self.live_bitmap.as_ref()
    }

    fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    fn is_movable(&self) -> bool {
        self.policy == GcRetentionPolicy::AlwaysCollect
    }
}

impl std::fmt::Debug for BumpPointerSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BumpPointerSpace")
            .field("name", &self.name)
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("end", &format_args!("{:#x}", self.end()))
            .field("limit", &format_args!("{:#x}", self.limit))
            .finish_non_exhaustive()
    }
}
