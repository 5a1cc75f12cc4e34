//! Non-moving free-list space.
//!
//! Small objects are served from segregated size classes, larger ones from
//! page-granular chunks kept in a best-fit map. Freed memory is zeroed before
//! it is reused, so every allocation returns zeroed memory. An allocation
//! record doubles as the double-free detector for sweep.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sys_alloc::Mmap;

use crate::error::heap_corruption;
use crate::gc::mark::HeapBitmap;
use crate::gc::sync::{ordered, LockOrder};
use crate::object::{align_object_size, ObjectRef};
use crate::space::{ContinuousSpace, GcRetentionPolicy, SpaceBitmaps, SpaceId};

/// Size classes for object allocation.
/// Objects are routed to the smallest size class that fits them.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Objects larger than this are served from page-granular chunks.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

/// Granularity of large chunks.
const LARGE_CHUNK_ALIGN: usize = 4096;

fn size_class(bytes: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| bytes <= class)
}

/// Bytes actually reserved for a request of `bytes`.
#[must_use]
pub fn chunk_size(bytes: usize) -> usize {
    let bytes = align_object_size(bytes.max(1));
    size_class(bytes).map_or_else(
        || bytes.div_ceil(LARGE_CHUNK_ALIGN) * LARGE_CHUNK_ALIGN,
        |class| SIZE_CLASSES[class],
    )
}

struct FreeListState {
    cursor: usize,
    small: [Vec<usize>; SIZE_CLASSES.len()],
    /// Free large chunks by size.
    large: BTreeMap<usize, Vec<usize>>,
    /// Chunk size of every allocated object, keyed by address.
    allocations: FxHashMap<usize, usize>,
}

/// A swept, non-moving space.
pub struct FreeListSpace {
    name: String,
    begin: usize,
    limit: usize,
    end: AtomicUsize,
    mem: Arc<Mmap>,
    bitmaps: SpaceBitmaps,
    state: Mutex<FreeListState>,
    objects_allocated: AtomicUsize,
    bytes_allocated: AtomicUsize,
}

impl FreeListSpace {
    /// Creates a space over `[begin, begin + capacity)` of `mem`.
    #[must_use]
    pub fn new(name: &str, mem: Arc<Mmap>, begin: usize, capacity: usize) -> Self {
        debug_assert!(mem.contains_range(begin, capacity));
        Self {
            name: name.to_owned(),
            begin,
            limit: begin + capacity,
            end: AtomicUsize::new(begin),
            mem,
            bitmaps: SpaceBitmaps::new(name, begin, capacity),
            state: Mutex::new(FreeListState {
                cursor: begin,
                small: Default::default(),
                large: BTreeMap::new(),
                allocations: FxHashMap::default(),
            }),
            objects_allocated: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
        }
    }

    /// The live/mark bitmap pair.
    #[must_use]
    pub const fn bitmaps(&self) -> &SpaceBitmaps {
        &self.bitmaps
    }

    /// Allocates zeroed memory for `bytes` and sets its live bit.
    ///
    /// The caller holds the heap bitmap lock in shared mode so the live
    /// bitmap cannot swap roles underneath it.
    pub fn alloc(&self, bytes: usize) -> Option<ObjectRef> {
        let size = chunk_size(bytes);
        let addr = {
            let mut state = ordered(LockOrder::SpaceAllocator, || self.state.lock());
            let addr = match size_class(size) {
                Some(class) => match state.small[class].pop() {
                    Some(addr) => addr,
                    None => Self::bump(&mut state, size, self.limit)?,
                },
                None => match Self::best_fit(&mut state, size) {
                    Some(addr) => addr,
                    None => Self::bump(&mut state, size, self.limit)?,
                },
            };
            state.allocations.insert(addr, size);
            self.end.store(state.cursor, Ordering::Release);
            addr
        };
        let obj = ObjectRef::new(addr)?;
        self.bitmaps.live().set(obj);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        Some(obj)
    }

    fn bump(state: &mut FreeListState, size: usize, limit: usize) -> Option<usize> {
        let addr = state.cursor;
        let next = addr.checked_add(size)?;
        if next > limit {
            return None;
        }
        state.cursor = next;
        Some(addr)
    }

    fn best_fit(state: &mut FreeListState, size: usize) -> Option<usize> {
        let (&chunk, _) = state.large.range(size..).next()?;
        let list = state.large.get_mut(&chunk)?;
        let addr = list.pop()?;
        if list.is_empty() {
            state.large.remove(&chunk);
        }
        if chunk > size {
            state.large.entry(chunk - size).or_default().push(addr + size);
        }
        Some(addr)
    }

    /// Frees a batch of dead objects. Returns `(objects, bytes)` reclaimed.
    ///
    /// Bitmaps are left untouched; sweep swaps them afterwards.
    ///
    /// # Panics
    ///
    /// Panics on an object that is not currently allocated (double free).
    pub(crate) fn free_list(&self, batch: &[ObjectRef]) -> (usize, usize) {
        let mut state = ordered(LockOrder::SpaceAllocator, || self.state.lock());
        let mut bytes = 0;
        for obj in batch {
            let Some(size) = state.allocations.remove(&obj.addr()) else {
                heap_corruption!("double free of {obj:?} in {}", self.name);
            };
            self.zero(obj.addr(), size);
            match size_class(size) {
                Some(class) => state.small[class].push(obj.addr()),
                None => state.large.entry(size).or_default().push(obj.addr()),
            }
            bytes += size;
        }
        drop(state);
        self.objects_allocated.fetch_sub(batch.len(), Ordering::Relaxed);
        self.bytes_allocated.fetch_sub(bytes, Ordering::Relaxed);
        (batch.len(), bytes)
    }

    fn zero(&self, addr: usize, size: usize) {
        if size > MAX_SMALL_OBJECT_SIZE {
            if let Err(err) = self.mem.discard(addr, size) {
                heap_corruption!("{}: failed to release {addr:#x}: {err}", self.name);
            }
        } else {
            // SAFETY: the chunk is inside this space and no longer referenced.
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
        }
    }

    /// Whether `obj` is the start of an allocated object.
    #[must_use]
    pub fn is_allocated(&self, obj: ObjectRef) -> bool {
        ordered(LockOrder::SpaceAllocator, || self.state.lock())
            .allocations
            .contains_key(&obj.addr())
    }

    /// Bytes reserved for `obj`, if allocated.
    #[must_use]
    pub fn allocation_size(&self, obj: ObjectRef) -> Option<usize> {
        ordered(LockOrder::SpaceAllocator, || self.state.lock())
            .allocations
            .get(&obj.addr())
            .copied()
    }
}

impl ContinuousSpace for FreeListSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> SpaceId {
        SpaceId::Main
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
        GcRetentionPolicy::AlwaysCollect
    }

    fn mark_bitmap(&self) -> &HeapBitmap {
        self.bitmaps.mark()
    }

    fn live_bitmap(&self) -> Option<&HeapBitmap> {
        Some(self.bitmaps.live())
    }

    fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FreeListSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListSpace")
            .field("name", &self.name)
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("limit", &format_args!("{:#x}", self.limit))
            .field("objects", &self.objects_allocated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sys_alloc::MmapOptions;

    fn space(capacity: usize) -> FreeListSpace {
        let mem = Arc::new(MmapOptions::new().len(capacity).map_anon().unwrap());
        let begin = mem.ptr() as usize;
        FreeListSpace::new("main", mem, begin, capacity)
    }

    #[test]
    fn test_chunk_sizes() {
        assert_eq!(chunk_size(1), 16);
        assert_eq!(chunk_size(17), 32);
        assert_eq!(chunk_size(2048), 2048);
        assert_eq!(chunk_size(2049), 4096);
        assert_eq!(chunk_size(9000), 12288);
    }

    #[test]
    fn test_alloc_sets_live_bit_and_records() {
        let space = space(1 << 16);
        let obj = space.alloc(40).unwrap();
        assert!(space.bitmaps().live().test(obj));
        assert!(space.is_allocated(obj));
        assert_eq!(space.allocation_size(obj), Some(64));
        assert_eq!(space.bytes_allocated(), 64);
    }

    #[test]
    fn test_freed_chunk_is_zeroed_and_reused() {
        let space = space(1 << 16);
        let obj = space.alloc(32).unwrap();
        unsafe { std::ptr::write_bytes(obj.as_ptr(), 0xCD, 32) };
        assert_eq!(space.free_list(&[obj]), (1, 32));
        assert!(!space.is_allocated(obj));

        let again = space.alloc(32).unwrap();
        assert_eq!(again, obj);
        assert!((0..32).all(|i| unsafe { obj.as_ptr().add(i).read() } == 0));
    }

    #[test]
    fn test_large_chunks_split_best_fit() {
        let space = space(1 << 20);
        let big = space.alloc(3 * 4096).unwrap();
        let _guard = space.alloc(16).unwrap();
        space.free_list(&[big]);

        let first = space.alloc(4096).unwrap();
        assert_eq!(first, big);
        let second = space.alloc(8000).unwrap();
        assert_eq!(second.addr(), big.addr() + 4096);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let space = space(1 << 16);
        let obj = space.alloc(16).unwrap();
        space.free_list(&[obj]);
        space.free_list(&[obj]);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let space = space(4096);
        let mut n = 0;
        while space.alloc(1024).is_some() {
            n += 1;
        }
        assert_eq!(n, 4);
    }
}
