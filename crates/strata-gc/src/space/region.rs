//! Region space.
//!
//! The space is split into fixed-size regions. Mutators bump-allocate inside
//! the current to-space region; objects larger than a region take a run of
//! contiguous regions (one `Large` head followed by `LargeTail`s). During a
//! collection every allocated region is classified as from-space (dead or
//! worth evacuating) or unevacuated from-space (kept in place). From-space
//! regions are zeroed and freed once their survivors have been copied out.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sys_alloc::Mmap;

use crate::error::heap_corruption;
use crate::gc::mark::HeapBitmap;
use crate::gc::sync::{ordered, LockOrder};
use crate::object::{align_object_size, ObjectModel, ObjectRef};
use crate::space::{ContinuousSpace, GcRetentionPolicy, SpaceId};

const NO_REGION: usize = usize::MAX;

/// Position of a region in its collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// Unused; `top == begin`.
    Free = 0,
    /// Allocated into since the last cycle.
    ToSpace = 1,
    /// Being reclaimed this cycle; survivors are evacuated.
    FromSpace = 2,
    /// Collected in place this cycle.
    UnevacFromSpace = 3,
}

impl RegionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ToSpace,
            2 => Self::FromSpace,
            3 => Self::UnevacFromSpace,
            _ => Self::Free,
        }
    }
}

/// What a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionKind {
    /// Bump-allocated small objects.
    Normal = 0,
    /// Start of an object larger than a region.
    Large = 1,
    /// Continuation of the preceding large object; no allocated bytes of its own.
    LargeTail = 2,
}

impl RegionKind {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Large,
            2 => Self::LargeTail,
            _ => Self::Normal,
        }
    }
}

/// Snapshot of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Position in the region table.
    pub index: usize,
    /// First address.
    pub begin: usize,
    /// Allocation cursor.
    pub top: usize,
    /// One past the last address.
    pub end: usize,
    /// Cycle state.
    pub state: RegionState,
    /// Content kind.
    pub kind: RegionKind,
    /// Bytes marked live by the current or last cycle.
    pub live_bytes: usize,
    /// Collection count when the region was allocated.
    pub alloc_time: u64,
    /// Objects allocated in the region.
    pub objects_allocated: usize,
}

struct Region {
    index: usize,
    begin: usize,
    end: usize,
    top: AtomicUsize,
    state: AtomicU8,
    kind: AtomicU8,
    live_bytes: AtomicUsize,
    alloc_time: AtomicU64,
    objects_allocated: AtomicUsize,
    /// Size of the large object headed by this region.
    large_size: AtomicUsize,
}

impl Region {
    fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    fn alloc(&self, bytes: usize) -> Option<ObjectRef> {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if self.end - top < bytes {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.objects_allocated.fetch_add(1, Ordering::Relaxed);
                    return ObjectRef::new(top);
                }
                Err(actual) => top = actual,
            }
        }
    }

    fn allocated_bytes(&self) -> usize {
        match self.kind() {
            RegionKind::Normal => self.top.load(Ordering::Acquire) - self.begin,
            RegionKind::Large => self.large_size.load(Ordering::Relaxed),
            RegionKind::LargeTail => 0,
        }
    }

    fn reset(&self) {
        self.top.store(self.begin, Ordering::Release);
        self.kind.store(RegionKind::Normal as u8, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.large_size.store(0, Ordering::Relaxed);
        self.set_state(RegionState::Free);
    }

    fn info(&self) -> RegionInfo {
        RegionInfo {
            index: self.index,
            begin: self.begin,
            top: self.top.load(Ordering::Acquire),
            end: self.end,
            state: self.state(),
            kind: self.kind(),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            alloc_time: self.alloc_time.load(Ordering::Relaxed),
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
        }
    }
}

/// How a cycle classified the allocated regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FromSpaceSummary {
    /// Regions with survivors that will be evacuated.
    pub evacuated: usize,
    /// Regions collected in place.
    pub unevacuated: usize,
    /// Regions (large tails included) with no survivors.
    pub dead: usize,
}

/// What `clear_from_space` gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedRegions {
    /// Regions returned to the free pool.
    pub regions: usize,
    /// Allocated bytes they held.
    pub bytes: usize,
    /// Objects they held, survivors included.
    pub objects: usize,
}

/// A space of fixed-size regions.
pub struct RegionSpace {
    name: String,
    begin: usize,
    limit: usize,
    region_size: usize,
    regions: Box<[Region]>,
    mem: Arc<Mmap>,
    mark_bitmap: HeapBitmap,
    current: AtomicUsize,
    evac_current: AtomicUsize,
    lock: Mutex<()>,
    time: AtomicU64,
}

impl RegionSpace {
    /// Creates a space of `capacity / region_size` free regions.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a multiple of `region_size`.
    #[must_use]
    pub fn new(name: &str, mem: Arc<Mmap>, begin: usize, capacity: usize, region_size: usize) -> Self {
        assert!(
            region_size > 0 && capacity % region_size == 0,
            "region space capacity must be a multiple of the region size"
        );
        debug_assert!(mem.contains_range(begin, capacity));
        let regions = (0..capacity / region_size)
            .map(|index| {
                let start = begin + index * region_size;
                Region {
                    index,
                    begin: start,
                    end: start + region_size,
                    top: AtomicUsize::new(start),
                    state: AtomicU8::new(RegionState::Free as u8),
                    kind: AtomicU8::new(RegionKind::Normal as u8),
                    live_bytes: AtomicUsize::new(0),
                    alloc_time: AtomicU64::new(0),
                    objects_allocated: AtomicUsize::new(0),
                    large_size: AtomicUsize::new(0),
                }
            })
            .collect();
        Self {
            name: name.to_owned(),
            begin,
            limit: begin + capacity,
            region_size,
            regions,
            mem,
            mark_bitmap: HeapBitmap::new(format!("{name} mark bitmap"), begin, capacity),
            current: AtomicUsize::new(NO_REGION),
            evac_current: AtomicUsize::new(NO_REGION),
            lock: Mutex::new(()),
            time: AtomicU64::new(0),
        }
    }

    /// Size of one region.
    #[must_use]
    pub const fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of regions.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Number of free regions.
    #[must_use]
    pub fn num_free_regions(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.state() == RegionState::Free)
            .count()
    }

    /// Index of the region containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the space.
    #[must_use]
    pub fn region_index(&self, addr: usize) -> usize {
        assert!(
            self.contains(addr),
            "{addr:#x} is outside region space {}",
            self.name
        );
        (addr - self.begin) / self.region_size
    }

    /// Snapshot of the region containing `addr`.
    #[must_use]
    pub fn region_of(&self, addr: usize) -> RegionInfo {
        self.regions[self.region_index(addr)].info()
    }

    /// Snapshot of every region.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions.iter().map(Region::info).collect()
    }

    /// Allocates `bytes`, taking a new region when the current one is full.
    pub fn alloc(&self, bytes: usize) -> Option<ObjectRef> {
        let bytes = align_object_size(bytes);
        if bytes > self.region_size {
            return self.alloc_large(bytes);
        }
        self.alloc_in(&self.current, bytes)
    }

    /// Allocates a survivor during evacuation, in regions separate from
    /// mutator allocation.
    pub(crate) fn alloc_evacuation(&self, bytes: usize) -> Option<ObjectRef> {
        self.alloc_in(&self.evac_current, align_object_size(bytes))
    }

    fn alloc_in(&self, current: &AtomicUsize, bytes: usize) -> Option<ObjectRef> {
        let index = current.load(Ordering::Acquire);
        if index != NO_REGION {
            if let Some(obj) = self.regions[index].alloc(bytes) {
                return Some(obj);
            }
        }
        let _lock = ordered(LockOrder::SpaceAllocator, || self.lock.lock());
        let index = current.load(Ordering::Acquire);
        if index != NO_REGION {
            if let Some(obj) = self.regions[index].alloc(bytes) {
                return Some(obj);
            }
        }
        let region = self.claim_free_run(1)?;
        let obj = self.regions[region].alloc(bytes);
        current.store(region, Ordering::Release);
        obj
    }

    fn alloc_large(&self, bytes: usize) -> Option<ObjectRef> {
        let count = bytes.div_ceil(self.region_size);
        let _lock = ordered(LockOrder::SpaceAllocator, || self.lock.lock());
        let head = self.claim_free_run(count)?;
        let first = &self.regions[head];
        first.kind.store(RegionKind::Large as u8, Ordering::Relaxed);
        first.large_size.store(bytes, Ordering::Relaxed);
        first.objects_allocated.store(1, Ordering::Relaxed);
        first.top.store(first.begin + bytes.min(self.region_size), Ordering::Release);
        for tail in &self.regions[head + 1..head + count] {
            tail.kind.store(RegionKind::LargeTail as u8, Ordering::Relaxed);
        }
        ObjectRef::new(first.begin)
    }

    /// Claims `count` contiguous free regions as to-space. Lock held.
    fn claim_free_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (index, region) in self.regions.iter().enumerate() {
            if region.state() != RegionState::Free {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let head = index + 1 - count;
                let now = self.time.load(Ordering::Relaxed);
                for region in &self.regions[head..=index] {
                    region.top.store(region.begin, Ordering::Relaxed);
                    region.alloc_time.store(now, Ordering::Relaxed);
                    region.set_state(RegionState::ToSpace);
                }
                return Some(head);
            }
        }
        None
    }

    /// Credits `bytes` of live data to the region holding `obj`.
    #[inline]
    pub(crate) fn add_live_bytes(&self, obj: ObjectRef, bytes: usize) {
        self.regions[self.region_index(obj.addr())]
            .live_bytes
            .fetch_add(align_object_size(bytes), Ordering::Relaxed);
    }

    /// Zeroes every region's live byte count before marking.
    pub(crate) fn clear_live_bytes(&self) {
        for region in self.regions.iter() {
            region.live_bytes.store(0, Ordering::Relaxed);
        }
    }

    /// Classifies allocated regions for this cycle from their live bytes.
    ///
    /// Dead regions (and their large tails) become from-space. Normal regions
    /// whose live fraction is below `evacuate_live_ratio` become from-space
    /// too, as long as the free regions can hold their survivors; the rest
    /// are unevacuated. Mutator and evacuation cursors are reset.
    pub(crate) fn set_from_space(&self, evacuate_live_ratio: f64) -> FromSpaceSummary {
        let _lock = ordered(LockOrder::SpaceAllocator, || self.lock.lock());
        self.current.store(NO_REGION, Ordering::Release);
        self.evac_current.store(NO_REGION, Ordering::Release);
        self.time.fetch_add(1, Ordering::Relaxed);

        let mut summary = FromSpaceSummary::default();
        let mut candidates = Vec::new();
        let mut index = 0;
        while index < self.regions.len() {
            let region = &self.regions[index];
            let span = self.span_of(index);
            if region.state() != RegionState::ToSpace || region.kind() == RegionKind::LargeTail {
                index += span;
                continue;
            }
            let live = region.live_bytes.load(Ordering::Relaxed);
            let allocated = region.allocated_bytes();
            if live == 0 {
                self.set_span_state(index, span, RegionState::FromSpace);
                summary.dead += span;
            } else if region.kind() == RegionKind::Normal
                && (live as f64) < evacuate_live_ratio * (allocated as f64)
            {
                candidates.push((live, allocated, index));
            } else {
                self.set_span_state(index, span, RegionState::UnevacFromSpace);
                summary.unevacuated += span;
            }
            index += span;
        }

        // Sparse regions first; a survivor run of `live` bytes packs into at
        // most 2 * live / region_size + 1 regions.
        candidates.sort_by(|a, b| by_live_ratio((a.0, a.1), (b.0, b.1)));
        let free = self.regions.iter().filter(|r| r.state() == RegionState::Free).count();
        let mut evacuated_live = 0;
        for (live, _, index) in candidates {
            let needed = (2 * (evacuated_live + live)).div_ceil(self.region_size) + 1;
            if needed <= free {
                evacuated_live += live;
                self.regions[index].set_state(RegionState::FromSpace);
                summary.evacuated += 1;
            } else {
                self.regions[index].set_state(RegionState::UnevacFromSpace);
                summary.unevacuated += 1;
            }
        }
        summary
    }

    /// Number of regions covered by the allocation starting at `index`.
    fn span_of(&self, index: usize) -> usize {
        if self.regions[index].kind() != RegionKind::Large {
            return 1;
        }
        1 + self.regions[index + 1..]
            .iter()
            .take_while(|r| r.kind() == RegionKind::LargeTail)
            .count()
    }

    fn set_span_state(&self, index: usize, span: usize, state: RegionState) {
        for region in &self.regions[index..index + span] {
            region.set_state(state);
        }
    }

    /// Whether `addr` lies in a from-space region.
    #[inline]
    #[must_use]
    pub fn is_in_from_space(&self, addr: usize) -> bool {
        self.contains(addr) && self.regions[self.region_index(addr)].state() == RegionState::FromSpace
    }

    /// Frees every from-space region and returns unevacuated regions to
    /// to-space.
    ///
    /// # Panics
    ///
    /// Panics if the pages of a freed region cannot be released.
    pub(crate) fn clear_from_space(&self) -> ClearedRegions {
        let _lock = ordered(LockOrder::SpaceAllocator, || self.lock.lock());
        let mut cleared = ClearedRegions::default();
        for region in self.regions.iter() {
            match region.state() {
                RegionState::FromSpace => {
                    cleared.regions += 1;
                    cleared.bytes += region.allocated_bytes();
                    cleared.objects += region.objects_allocated.load(Ordering::Relaxed);
                    let used_end = if region.kind() == RegionKind::Normal {
                        region.top.load(Ordering::Acquire)
                    } else {
                        region.end
                    };
                    self.mark_bitmap.clear_range(region.begin, region.end);
                    if let Err(err) = self.mem.discard(region.begin, used_end - region.begin) {
                        heap_corruption!("{}: failed to release region {}: {err}", self.name, region.index);
                    }
                    region.reset();
                }
                RegionState::UnevacFromSpace => region.set_state(RegionState::ToSpace),
                RegionState::Free | RegionState::ToSpace => {}
            }
        }
        cleared
    }

    /// Frees the regions in which marking found nothing live, without
    /// evacuating anything. Used by non-moving collections.
    pub(crate) fn reclaim_dead_regions(&self) -> ClearedRegions {
        self.set_from_space(0.0);
        self.clear_from_space()
    }

    /// Visits every allocated object in address order.
    ///
    /// Requires a quiescent space.
    pub fn walk(&self, model: &dyn ObjectModel, mut visitor: impl FnMut(ObjectRef)) {
        for region in self.regions.iter() {
            if region.state() == RegionState::Free {
                continue;
            }
            match region.kind() {
                RegionKind::LargeTail => {}
                RegionKind::Large => {
                    if let Some(obj) = ObjectRef::new(region.begin) {
                        visitor(obj);
                    }
                }
                RegionKind::Normal => {
                    let top = region.top.load(Ordering::Acquire);
                    let mut pos = region.begin;
                    while pos < top {
                        let Some(obj) = ObjectRef::new(pos) else { break };
                        let size = align_object_size(model.size_of(obj));
                        if size == 0 {
                            heap_corruption!("{}: zero-sized object at {pos:#x}", self.name);
                        }
                        visitor(obj);
                        pos += size;
                    }
                }
            }
        }
    }
}

impl ContinuousSpace for RegionSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> SpaceId {
        SpaceId::Region
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.limit
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::AlwaysCollect
    }

    fn mark_bitmap(&self) -> &HeapBitmap {
        &self.mark_bitmap
    }

    fn live_bitmap(&self) -> Option<&HeapBitmap> {
        None
    }

    fn bytes_allocated(&self) -> usize {
        self.regions.iter().map(Region::allocated_bytes).sum()
    }

    fn objects_allocated(&self) -> usize {
        self.regions
            .iter()
            .map(|r| r.objects_allocated.load(Ordering::Relaxed))
            .sum()
    }

    fn is_movable(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for RegionSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionSpace")
            .field("name", &self.name)
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("regions", &self.regions.len())
            .field("region_size", &self.region_size)
            .finish_non_exhaustive()
    }
}

/// Orders `(live, allocated)` byte counts by live ratio, sparsest first.
/// The cross products are taken in `u128`, since each factor may be close
/// to `usize::MAX` for large regions.
fn by_live_ratio(a: (usize, usize), b: (usize, usize)) -> std::cmp::Ordering {
    (a.0 as u128 * b.1 as u128).cmp(&(b.0 as u128 * a.1 as u128))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sys_alloc::MmapOptions;

    const REGION: usize = 4096;

    #[test]
    fn test_live_ratio_order_survives_huge_counts() {
        use std::cmp::Ordering as Cmp;

        let big = usize::MAX / 2;
        // 1/4 live against 1/2 live; the products overflow in `usize`.
        assert_eq!(by_live_ratio((big / 4, big), (big / 2, big)), Cmp::Less);
        assert_eq!(by_live_ratio((big / 2, big), (big / 4, big)), Cmp::Greater);
        assert_eq!(by_live_ratio((big, big), (usize::MAX, usize::MAX)), Cmp::Equal);

        let mut candidates = vec![(big / 2, big, 0), (big / 8, big, 1), (big / 4, big, 2)];
        candidates.sort_by(|a, b| by_live_ratio((a.0, a.1), (b.0, b.1)));
        let order: Vec<usize> = candidates.iter().map(|c| c.2).collect();
        assert_eq!(order, [1, 2, 0]);
    }

    fn space(regions: usize) -> RegionSpace {
        let capacity = regions * REGION;
        let mem = Arc::new(MmapOptions::new().len(capacity).map_anon().unwrap());
        let begin = mem.ptr() as usize;
        RegionSpace::new("regions", mem, begin, capacity, REGION)
    }

    #[test]
    fn test_allocation_moves_to_next_region_when_full() {
        let space = space(4);
        let a = space.alloc(3000).unwrap();
        let b = space.alloc(3000).unwrap();
        assert_eq!(space.region_of(a.addr()).index, 0);
        assert_eq!(space.region_of(b.addr()).index, 1);
        assert_eq!(space.region_of(a.addr()).state, RegionState::ToSpace);
        assert_eq!(space.num_free_regions(), 2);
    }

    #[test]
    fn test_large_object_spans_tail_regions() {
        let space = space(4);
        let big = space.alloc(REGION * 2 + 8).unwrap();
        let infos = space.regions();
        assert_eq!(infos[0].kind, RegionKind::Large);
        assert_eq!(infos[0].top, infos[0].end);
        for tail in &infos[1..3] {
            assert_eq!(tail.kind, RegionKind::LargeTail);
            assert_eq!(tail.top, tail.begin);
        }
        assert_eq!(big.addr(), infos[0].begin);
        assert_eq!(space.bytes_allocated(), REGION * 2 + 8);
        assert!(space.alloc(REGION * 2).is_none());
    }

    #[test]
    fn test_dead_regions_are_freed_and_survivors_kept() {
        let space = space(4);
        let a = space.alloc(4000).unwrap();
        let _b = space.alloc(4000).unwrap();
        space.add_live_bytes(a, 4000);

        let summary = space.set_from_space(0.0);
        assert_eq!(summary, FromSpaceSummary { evacuated: 0, unevacuated: 1, dead: 1 });
        let cleared = space.clear_from_space();
        assert_eq!(cleared.regions, 1);
        assert_eq!(cleared.bytes, 4000);
        assert_eq!(space.region_of(a.addr()).state, RegionState::ToSpace);
        assert_eq!(space.num_free_regions(), 3);
    }

    #[test]
    fn test_sparse_region_is_evacuated_within_budget() {
        let space = space(8);
        let a = space.alloc(64).unwrap();
        let _filler = space.alloc(3000).unwrap();
        space.add_live_bytes(a, 64);

        let summary = space.set_from_space(0.75);
        assert_eq!(summary.evacuated, 1);
        assert!(space.is_in_from_space(a.addr()));

        let copy = space.alloc_evacuation(64).unwrap();
        assert!(!space.is_in_from_space(copy.addr()));
        assert_eq!(space.region_of(copy.addr()).state, RegionState::ToSpace);

        space.clear_from_space();
        assert_eq!(space.region_of(a.addr()).state, RegionState::Free);
    }

    #[test]
    fn test_freed_region_reads_back_zero() {
        let space = space(2);
        let a = space.alloc(256).unwrap();
        unsafe { std::ptr::write_bytes(a.as_ptr(), 0x5A, 256) };
        space.set_from_space(0.0);
        space.clear_from_space();
        assert!((0..256).all(|i| unsafe { a.as_ptr().add(i).read() } == 0));
    }
}
