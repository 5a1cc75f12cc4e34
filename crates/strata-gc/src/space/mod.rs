//! Allocation spaces carved out of the heap reservation.
//!
//! Every space is a contiguous `[begin, limit)` range with its own mark
//! bitmap. The free-list space additionally keeps a live bitmap that swaps
//! roles with the mark bitmap after each sweep.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::mark::HeapBitmap;

pub mod bump_pointer;
pub mod free_list;
pub mod region;

pub use bump_pointer::{BumpPointerSpace, Tlab, BLOCK_HEADER_SIZE};
pub use free_list::FreeListSpace;
pub use region::{ClearedRegions, FromSpaceSummary, RegionInfo, RegionKind, RegionSpace, RegionState};

/// The spaces a heap may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceId {
    /// Never collected; bound as the immune region.
    Immune,
    /// Non-moving free-list space.
    Main,
    /// Bump-pointer space, compacted by sliding.
    Bump,
    /// Region space, reclaimed and evacuated per region.
    Region,
}

/// Whether collections reclaim a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRetentionPolicy {
    /// Objects live forever; the space is immune.
    NeverCollect,
    /// Every collection reclaims dead objects.
    AlwaysCollect,
}

/// Common view of a contiguous space.
pub trait ContinuousSpace: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;
    /// Which heap space this is.
    fn id(&self) -> SpaceId;
    /// First address.
    fn begin(&self) -> usize;
    /// One past the highest address ever handed out.
    fn end(&self) -> usize;
    /// One past the last reserved address.
    fn limit(&self) -> usize;
    /// Collection policy.
    fn retention_policy(&self) -> GcRetentionPolicy;
    /// The bitmap marking writes to.
    fn mark_bitmap(&self) -> &HeapBitmap;
    /// The bitmap of allocated objects, for spaces that keep one.
    fn live_bitmap(&self) -> Option<&HeapBitmap>;
    /// Bytes currently allocated.
    fn bytes_allocated(&self) -> usize;
    /// Objects currently allocated.
    fn objects_allocated(&self) -> usize;

    /// Whether `addr` is inside the reserved range.
    fn contains(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.limit()
    }

    /// Whether collections may move objects in this space.
    fn is_movable(&self) -> bool {
        false
    }
}

/// Two bitmaps whose live/mark roles alternate.
///
/// Readers hold the heap bitmap lock in shared mode; [`swap`](Self::swap) is
/// called with it held exclusively.
#[derive(Debug)]
pub struct SpaceBitmaps {
    bitmaps: [HeapBitmap; 2],
    live_index: AtomicUsize,
}

impl SpaceBitmaps {
    /// Creates two clear bitmaps over `[begin, begin + capacity)`.
    #[must_use]
    pub fn new(name: &str, begin: usize, capacity: usize) -> Self {
        Self {
            bitmaps: [
                HeapBitmap::new(format!("{name} bitmap a"), begin, capacity),
                HeapBitmap::new(format!("{name} bitmap b"), begin, capacity),
            ],
            live_index: AtomicUsize::new(0),
        }
    }

    /// The bitmap of allocated objects.
    #[must_use]
    pub fn live(&self) -> &HeapBitmap {
        &self.bitmaps[self.live_index.load(Ordering::Acquire)]
    }

    /// The bitmap marking writes to.
    #[must_use]
    pub fn mark(&self) -> &HeapBitmap {
        &self.bitmaps[1 - self.live_index.load(Ordering::Acquire)]
    }

    /// Makes the mark bitmap the live bitmap and vice versa.
    pub fn swap(&self) {
        self.live_index.fetch_xor(1, Ordering::AcqRel);
    }
}
