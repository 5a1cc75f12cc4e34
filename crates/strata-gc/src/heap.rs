//! The heap: one address-space reservation carved into spaces, plus all
//! collector state.
//!
//! Nothing here is global. Every phase of every collector takes `&Heap`, so
//! several heaps can live side by side in one process.
//!
//! The reservation is laid out as `immune | main | bump | region`, with
//! absent spaces taking no room. One card table covers all of it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashSet;
use sys_alloc::{Mmap, MmapOptions};

use crate::config::HeapConfig;
use crate::error::{heap_corruption, AllocError, HeapError, VerifyError};
use crate::gc::card_table::CardTable;
use crate::gc::checkpoint::{MutatorRecord, ThreadList};
use crate::gc::immune::ImmuneRegion;
use crate::gc::mark::{HeapBitmap, MarkStack};
use crate::gc::mark_compact::MarkCompact;
use crate::gc::mark_sweep::MarkSweep;
use crate::gc::mod_union::ModUnionTable;
use crate::gc::reference::ReferenceProcessor;
use crate::gc::sync::{ordered, LockOrder, Ordered};
use crate::metrics::{CollectionType, GcMetrics, HeapStats};
use crate::mutator::Mutator;
use crate::object::{align_object_size, ObjectModel, ObjectRef, ReferenceKind, Slot, OBJECT_ALIGNMENT};
use crate::roots::{RootHandle, RootTable};
use crate::space::{
    BumpPointerSpace, ContinuousSpace, FreeListSpace, GcRetentionPolicy, RegionSpace, RegionState,
    SpaceId, Tlab,
};

/// What a collection is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Mark-sweep: concurrent, or paused when the heap is configured
    /// without concurrency. Never moves objects.
    Partial,
    /// Mark-compact when a moving space exists and full collections
    /// compact; otherwise a stop-the-world mark-sweep.
    Full,
}

/// A garbage-collected heap.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) model: Arc<dyn ObjectModel>,
    begin: usize,
    end: usize,
    pub(crate) immune_space: Option<BumpPointerSpace>,
    pub(crate) main_space: FreeListSpace,
    pub(crate) bump_space: Option<BumpPointerSpace>,
    pub(crate) region_space: Option<RegionSpace>,
    pub(crate) card_table: CardTable,
    pub(crate) mod_union: Option<ModUnionTable>,
    /// Guards the live/mark role swap of the main space.
    bitmap_lock: RwLock<()>,
    gc_lock: Mutex<()>,
    pub(crate) mark_stack: Mutex<MarkStack>,
    pub(crate) references: ReferenceProcessor,
    pub(crate) threads: ThreadList,
    globals: Mutex<RootTable>,
    /// Set from the start of marking until sweep takes the bitmap lock;
    /// allocations made meanwhile are born marked.
    pub(crate) marking_active: AtomicBool,
    /// Bumped when a collection starts, before it reads any root.
    pub(crate) gc_epoch: AtomicU64,
    last_metrics: Mutex<GcMetrics>,
    stats: HeapStats,
    _mem: Arc<Mmap>,
}

impl Heap {
    /// Reserves memory for every configured space and builds the heap.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Config`] for an invalid configuration and
    /// [`HeapError::Reserve`] when the address range cannot be mapped.
    pub fn new(config: HeapConfig, model: Arc<dyn ObjectModel>) -> Result<Arc<Self>, HeapError> {
        config.validate()?;
        let page = sys_alloc::page_size();
        let round = |bytes: usize| bytes.div_ceil(page) * page;
        let immune_len = round(config.immune_capacity);
        let main_len = round(config.main_capacity);
        let bump_len = round(config.bump_capacity);
        let region_len = round(config.region_capacity);
        let total = immune_len + main_len + bump_len + region_len;

        let mem = Arc::new(MmapOptions::new().len(total).map_anon()?);
        let begin = mem.ptr() as usize;
        let mut cursor = begin;
        let mut carve = |len: usize| {
            let start = cursor;
            cursor += len;
            start
        };
        let immune_begin = carve(immune_len);
        let main_begin = carve(main_len);
        let bump_begin = carve(bump_len);
        let region_begin = carve(region_len);

        let immune_space = (config.immune_capacity > 0).then(|| {
            BumpPointerSpace::new(
                "immune space",
                SpaceId::Immune,
                GcRetentionPolicy::NeverCollect,
                Arc::clone(&mem),
                immune_begin,
                config.immune_capacity,
            )
        });
        let mod_union = immune_space
            .as_ref()
            .map(|space| ModUnionTable::new(space.name(), space.begin(), space.limit()));
        let main_space = FreeListSpace::new("main space", Arc::clone(&mem), main_begin, config.main_capacity);
        let bump_space = (config.bump_capacity > 0).then(|| {
            BumpPointerSpace::new(
                "bump pointer space",
                SpaceId::Bump,
                GcRetentionPolicy::AlwaysCollect,
                Arc::clone(&mem),
                bump_begin,
                config.bump_capacity,
            )
        });
        let region_space = (config.region_capacity > 0).then(|| {
            RegionSpace::new(
                "region space",
                Arc::clone(&mem),
                region_begin,
                config.region_capacity,
                config.region_size,
            )
        });

        Ok(Arc::new(Self {
            card_table: CardTable::new(begin, total),
            mark_stack: Mutex::new(MarkStack::new(config.mark_stack_capacity)),
            references: ReferenceProcessor::new(Arc::clone(&model)),
            config,
            model,
            begin,
            end: begin + total,
            immune_space,
            main_space,
            bump_space,
            region_space,
            mod_union,
            bitmap_lock: RwLock::new(()),
            gc_lock: Mutex::new(()),
            threads: ThreadList::new(),
            globals: Mutex::new(RootTable::new()),
            marking_active: AtomicBool::new(false),
            gc_epoch: AtomicU64::new(0),
            last_metrics: Mutex::new(GcMetrics::new()),
            stats: HeapStats::new(),
            _mem: mem,
        }))
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The runtime's object layout.
    #[must_use]
    pub fn model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    /// The never-collected space, if configured.
    #[must_use]
    pub const fn immune_space(&self) -> Option<&BumpPointerSpace> {
        self.immune_space.as_ref()
    }

    /// The non-moving free-list space.
    #[must_use]
    pub const fn main_space(&self) -> &FreeListSpace {
        &self.main_space
    }

    /// The bump-pointer space, if configured.
    #[must_use]
    pub const fn bump_space(&self) -> Option<&BumpPointerSpace> {
        self.bump_space.as_ref()
    }

    /// The region space, if configured.
    #[must_use]
    pub const fn region_space(&self) -> Option<&RegionSpace> {
        self.region_space.as_ref()
    }

    /// The card table covering the whole reservation.
    #[must_use]
    pub const fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// The mod-union table of the immune space, if there is one.
    #[must_use]
    pub const fn mod_union_table(&self) -> Option<&ModUnionTable> {
        self.mod_union.as_ref()
    }

    /// The reference processor.
    #[must_use]
    pub const fn reference_processor(&self) -> &ReferenceProcessor {
        &self.references
    }

    /// Every configured space, in address order.
    pub fn spaces(&self) -> impl Iterator<Item = &dyn ContinuousSpace> + '_ {
        [
            self.immune_space.as_ref().map(|s| s as &dyn ContinuousSpace),
            Some(&self.main_space as &dyn ContinuousSpace),
            self.bump_space.as_ref().map(|s| s as &dyn ContinuousSpace),
            self.region_space.as_ref().map(|s| s as &dyn ContinuousSpace),
        ]
        .into_iter()
        .flatten()
    }

    /// The space holding `addr`, if any.
    #[must_use]
    pub fn space_of(&self, addr: usize) -> Option<SpaceId> {
        if addr < self.begin || addr >= self.end {
            return None;
        }
        self.spaces().find(|s| s.contains(addr)).map(|s| s.id())
    }

    /// Whether `addr` lies inside some space.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.space_of(addr).is_some()
    }

    fn space(&self, id: SpaceId) -> &dyn ContinuousSpace {
        match id {
            SpaceId::Immune => self.immune_space.as_ref().map(|s| s as &dyn ContinuousSpace),
            SpaceId::Main => Some(&self.main_space as &dyn ContinuousSpace),
            SpaceId::Bump => self.bump_space.as_ref().map(|s| s as &dyn ContinuousSpace),
            SpaceId::Region => self.region_space.as_ref().map(|s| s as &dyn ContinuousSpace),
        }
        .unwrap_or_else(|| heap_corruption!("heap has no {id:?} space"))
    }

    /// The bitmap marking writes to for space `id`.
    pub(crate) fn mark_bitmap(&self, id: SpaceId) -> &HeapBitmap {
        self.space(id).mark_bitmap()
    }

    /// The bitmap card scanning walks: the live bitmap for the immune
    /// space, whose objects are never marked, the mark bitmap otherwise.
    pub(crate) fn scan_bitmap(&self, id: SpaceId) -> &HeapBitmap {
        let space = self.space(id);
        match space.retention_policy() {
            GcRetentionPolicy::NeverCollect => space.live_bitmap().unwrap_or_else(|| space.mark_bitmap()),
            GcRetentionPolicy::AlwaysCollect => space.mark_bitmap(),
        }
    }

    pub(crate) fn bitmap_read(&self) -> Ordered<RwLockReadGuard<'_, ()>> {
        ordered(LockOrder::HeapBitmap, || self.bitmap_lock.read())
    }

    pub(crate) fn bitmap_write(&self) -> Ordered<RwLockWriteGuard<'_, ()>> {
        ordered(LockOrder::HeapBitmap, || self.bitmap_lock.write())
    }

    /// Whether the current cycle has marked `obj`. Immune objects are
    /// always marked.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the heap.
    #[must_use]
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        match self.space_of(obj.addr()) {
            Some(SpaceId::Immune) => true,
            Some(id) => self.mark_bitmap(id).test(obj),
            None => heap_corruption!("{obj:?} is outside the heap"),
        }
    }

    /// Whether `obj` is an allocated object that no collection has reclaimed.
    ///
    /// Bump-pointer and region space objects count as live until their
    /// memory is compacted away or their region is freed.
    #[must_use]
    pub fn is_live(&self, obj: ObjectRef) -> bool {
        match self.space_of(obj.addr()) {
            None => false,
            Some(SpaceId::Immune) => self
                .immune_space
                .as_ref()
                .and_then(ContinuousSpace::live_bitmap)
                .is_some_and(|live| live.test(obj)),
            Some(SpaceId::Main) => self.main_space.is_allocated(obj),
            Some(SpaceId::Bump) => self
                .bump_space
                .as_ref()
                .is_some_and(|space| obj.addr() < space.end()),
            Some(SpaceId::Region) => self.region_space.as_ref().is_some_and(|space| {
                let region = space.region_of(obj.addr());
                region.state != RegionState::Free && obj.addr() < region.top
            }),
        }
    }

    /// Total bytes allocated across all spaces.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.spaces().map(ContinuousSpace::bytes_allocated).sum()
    }

    /// Allocates `bytes` in `space` without collecting.
    ///
    /// `record` routes small bump-pointer allocations through the mutator's
    /// TLAB. Returns `Ok(None)` when the space is full.
    pub(crate) fn try_allocate(
        &self,
        record: Option<&MutatorRecord>,
        space: SpaceId,
        bytes: usize,
    ) -> Result<Option<ObjectRef>, AllocError> {
        let bytes = align_object_size(bytes.max(OBJECT_ALIGNMENT));
        let obj = match space {
            SpaceId::Immune => {
                let immune = self.immune_space.as_ref().ok_or(AllocError::NoSuchSpace(space))?;
                immune.alloc(bytes).inspect(|&obj| {
                    if let Some(live) = immune.live_bitmap() {
                        live.set(obj);
                    }
                })
            }
            SpaceId::Main => {
                let _bitmaps = self.bitmap_read();
                self.main_space.alloc(bytes).inspect(|&obj| self.allocate_black(space, obj, bytes))
            }
            SpaceId::Bump => {
                let bump = self.bump_space.as_ref().ok_or(AllocError::NoSuchSpace(space))?;
                match record {
                    Some(record) if bytes <= self.config.tlab_size / 2 => {
                        let mut tlab = ordered(LockOrder::MutatorState, || record.tlab.lock());
                        let _bitmaps = self.bitmap_read();
                        self.alloc_in_tlab(bump, &mut tlab, bytes)
                            .inspect(|&obj| self.allocate_black(space, obj, bytes))
                    }
                    _ => {
                        let _bitmaps = self.bitmap_read();
                        bump.alloc(bytes).inspect(|&obj| self.allocate_black(space, obj, bytes))
                    }
                }
            }
            SpaceId::Region => {
                let region = self.region_space.as_ref().ok_or(AllocError::NoSuchSpace(space))?;
                let _bitmaps = self.bitmap_read();
                region.alloc(bytes).inspect(|&obj| self.allocate_black(space, obj, bytes))
            }
        };
        if obj.is_some() {
            self.stats.record_allocation(bytes);
        }
        Ok(obj)
    }

    fn alloc_in_tlab(&self, bump: &BumpPointerSpace, tlab: &mut Option<Tlab>, bytes: usize) -> Option<ObjectRef> {
        if let Some(obj) = tlab.as_mut().and_then(|t| t.alloc(bytes)) {
            bump.record_allocation(bytes);
            return Some(obj);
        }
        let Some(mut fresh) = bump.alloc_tlab(self.config.tlab_size) else {
            return bump.alloc(bytes);
        };
        let obj = fresh.alloc(bytes)?;
        bump.record_allocation(bytes);
        *tlab = Some(fresh);
        Some(obj)
    }

    /// Sets the mark bit of a fresh object while a cycle is marking.
    /// Caller holds the bitmap lock shared.
    fn allocate_black(&self, space: SpaceId, obj: ObjectRef, bytes: usize) {
        if !self.marking_active.load(Ordering::Acquire) {
            return;
        }
        match space {
            SpaceId::Main => self.main_space.bitmaps().mark().set(obj),
            SpaceId::Bump => {
                if let Some(bump) = &self.bump_space {
                    bump.mark_bitmap().set(obj);
                }
            }
            SpaceId::Region => {
                if let Some(region) = &self.region_space {
                    if !region.mark_bitmap().atomic_test_and_set(obj) {
                        region.add_live_bytes(obj, bytes);
                    }
                }
            }
            SpaceId::Immune => {}
        }
    }

    /// Dirties the card covering `addr`.
    #[inline]
    pub fn mark_card(&self, addr: usize) {
        self.card_table.mark_card(addr);
    }

    /// Stores `value` into `slot` of `holder` behind the write barrier.
    ///
    /// The holder's card is dirtied before the store is published. Must be
    /// called by a runnable mutator (or with no collection running), so a
    /// checkpoint can never observe the barrier without the store.
    #[inline]
    pub fn write_reference(&self, holder: ObjectRef, slot: Slot, value: Option<ObjectRef>) {
        self.card_table.mark_card(holder.addr());
        slot.store(value);
    }

    /// Reads the referent of a reference object.
    ///
    /// Blocks while a concurrent cycle is deciding the referent's fate.
    /// Registered mutators should use [`Mutator::get_referent`], which
    /// suspends itself while it waits.
    #[must_use]
    pub fn get_referent(&self, reference: ObjectRef) -> Option<ObjectRef> {
        self.references.get_referent(reference, |r| self.is_marked(r))
    }

    /// Drains the cleared reference queue, oldest first.
    ///
    /// Until drained, cleared references stay reachable.
    #[must_use]
    pub fn take_cleared_references(&self) -> Vec<ObjectRef> {
        self.references.take_cleared()
    }

    /// Registers the calling thread as a mutator.
    #[must_use]
    pub fn attach_mutator(self: &Arc<Self>, name: &str) -> Mutator {
        Mutator::new(Arc::clone(self), name)
    }

    /// Number of attached mutators.
    #[must_use]
    pub fn mutator_count(&self) -> usize {
        self.threads.len()
    }

    /// Registers a global root.
    pub fn add_global_root(&self, value: Option<ObjectRef>) -> RootHandle {
        ordered(LockOrder::MutatorState, || self.globals.lock()).add(value)
    }

    /// Reads a global root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not a registered global root.
    #[must_use]
    pub fn global_root(&self, handle: RootHandle) -> Option<ObjectRef> {
        ordered(LockOrder::MutatorState, || self.globals.lock()).get(handle)
    }

    /// Overwrites a global root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not a registered global root.
    pub fn set_global_root(&self, handle: RootHandle, value: Option<ObjectRef>) {
        ordered(LockOrder::MutatorState, || self.globals.lock()).set(handle, value);
    }

    /// Unregisters a global root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not a registered global root.
    pub fn remove_global_root(&self, handle: RootHandle) {
        ordered(LockOrder::MutatorState, || self.globals.lock()).remove(handle);
    }

    /// Runs one collection and returns its metrics.
    ///
    /// Must not be called from a runnable mutator: the collector would wait
    /// for that thread to reach a safepoint. Use [`Mutator::collect`].
    ///
    /// # Panics
    ///
    /// Panics on any broken heap invariant and when mutators fail to reach
    /// a safepoint within the checkpoint timeout.
    pub fn collect(&self, kind: GcKind, clear_soft_references: bool) -> GcMetrics {
        let _cycle = ordered(LockOrder::GcCycle, || self.gc_lock.lock());
        self.gc_epoch.fetch_add(1, Ordering::AcqRel);
        let start = Instant::now();
        let gc_id = self.stats.next_collection();
        let bytes_allocated_before = self.bytes_allocated();
        let moving_space = self.bump_space.is_some() || self.region_space.is_some();
        let collection_type = match kind {
            GcKind::Partial if self.config.concurrent => CollectionType::ConcurrentMarkSweep,
            GcKind::Full if self.config.full_gc_compacts && moving_space => CollectionType::MarkCompact,
            GcKind::Partial | GcKind::Full => CollectionType::MarkSweep,
        };

        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(
            collection_type.as_str(),
            crate::tracing::internal::next_gc_id(),
        );

        let mut metrics = match collection_type {
            CollectionType::MarkCompact => MarkCompact::new(self).run(clear_soft_references),
            CollectionType::ConcurrentMarkSweep => MarkSweep::new(self, true).run(clear_soft_references),
            CollectionType::MarkSweep | CollectionType::None => {
                MarkSweep::new(self, false).run(clear_soft_references)
            }
        };
        metrics.gc_id = gc_id;
        metrics.collection_type = collection_type;
        metrics.clear_soft_references = clear_soft_references;
        metrics.bytes_allocated_before = bytes_allocated_before;
        metrics.bytes_allocated_after = self.bytes_allocated();
        metrics.duration = start.elapsed();

        self.stats.record(&metrics);
        *self.last_metrics.lock() = metrics;
        metrics
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> GcMetrics {
        *self.last_metrics.lock()
    }

    /// Cumulative statistics.
    #[must_use]
    pub const fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Binds every `NeverCollect` space into one immune region.
    pub(crate) fn bind_immune_spaces(&self) -> ImmuneRegion {
        let mut immune = ImmuneRegion::new();
        for space in self.spaces() {
            if space.retention_policy() == GcRetentionPolicy::NeverCollect
                && !immune.add_space(space.begin(), space.limit())
            {
                heap_corruption!("immune space {} is not adjacent to the immune region", space.name());
            }
        }
        immune
    }

    /// Records the immune space's dirty cards in its mod-union table and
    /// cleans the cards of every collectible space.
    pub(crate) fn process_cards(&self) {
        if let Some(table) = &self.mod_union {
            table.clear_cards(&self.card_table);
        }
        for space in self.collectible_spaces() {
            self.card_table.clear_cards(space.begin(), space.limit());
        }
    }

    /// Ages every card. The immune space goes through its mod-union table
    /// so no dirty card escapes the next cycle's rescan.
    pub(crate) fn age_cards(&self) {
        if let Some(table) = &self.mod_union {
            table.clear_cards(&self.card_table);
        }
        for space in self.collectible_spaces() {
            self.card_table.age_cards(space.begin(), space.limit());
        }
    }

    pub(crate) fn collectible_spaces(&self) -> impl Iterator<Item = &dyn ContinuousSpace> + '_ {
        self.spaces()
            .filter(|s| s.retention_policy() == GcRetentionPolicy::AlwaysCollect)
    }

    /// Roots owned by the heap rather than a mutator: global roots, the
    /// runtime's roots and the cleared reference queue.
    pub(crate) fn non_thread_roots(&self) -> Vec<ObjectRef> {
        let mut roots: Vec<ObjectRef> = ordered(LockOrder::MutatorState, || self.globals.lock())
            .iter()
            .collect();
        self.model.visit_roots(&mut |root| roots.push(*root));
        self.references.visit_cleared(|reference| roots.push(reference));
        roots
    }

    /// Roots of every mutator, read directly. The world must be stopped.
    pub(crate) fn suspended_thread_roots(&self) -> Vec<ObjectRef> {
        let mut roots = Vec::new();
        self.threads.for_each(|thread| roots.extend(thread.report_roots()));
        roots
    }

    /// Rewrites every root whose target `forward` relocates. The world must
    /// be stopped.
    pub(crate) fn update_roots(&self, forward: &dyn Fn(ObjectRef) -> Option<ObjectRef>) {
        let mut update = |root: &mut ObjectRef| {
            if let Some(new) = forward(*root) {
                *root = new;
            }
        };
        self.threads.for_each(|thread| {
            ordered(LockOrder::MutatorState, || thread.roots.lock()).visit_mut(&mut update);
        });
        ordered(LockOrder::MutatorState, || self.globals.lock()).visit_mut(&mut update);
        self.model.visit_roots(&mut update);
        self.references.update_roots(forward);
    }

    /// Drops every mutator's TLAB. The world must be stopped.
    pub(crate) fn revoke_tlabs(&self) {
        self.threads.for_each(|thread| {
            ordered(LockOrder::MutatorState, || thread.tlab.lock()).take();
        });
    }

    pub(crate) fn gc_lock(&self) -> Ordered<parking_lot::MutexGuard<'_, ()>> {
        ordered(LockOrder::GcCycle, || self.gc_lock.lock())
    }

    /// Checks that every reference reachable from the roots targets an
    /// allocated object with a valid header.
    ///
    /// Stops the world, so like [`collect`](Self::collect) it must not be
    /// called from a runnable mutator.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn verify_heap(&self) -> Result<(), VerifyError> {
        let _cycle = self.gc_lock();
        let _world = self.threads.suspend_all(self.config.checkpoint_timeout);

        let mut pending: Vec<(usize, ObjectRef)> = self
            .suspended_thread_roots()
            .into_iter()
            .chain(self.non_thread_roots())
            .map(|root| (0, root))
            .collect();
        if let Some(live) = self.immune_space.as_ref().and_then(ContinuousSpace::live_bitmap) {
            live.walk(|obj| pending.push((0, obj)));
        }

        let mut seen = FxHashSet::default();
        while let Some((holder, obj)) = pending.pop() {
            self.verify_target(holder, obj)?;
            if !seen.insert(obj) {
                continue;
            }
            self.model.visit_references(obj, &mut |slot| {
                if let Some(target) = slot.load() {
                    pending.push((obj.addr(), target));
                }
            });
            if self.model.reference_kind(obj) != ReferenceKind::None {
                if let Some(next) = self.model.pending_next_slot(obj).load() {
                    pending.push((obj.addr(), next));
                }
            }
        }
        Ok(())
    }

    fn verify_target(&self, holder: usize, target: ObjectRef) -> Result<(), VerifyError> {
        if self.space_of(target.addr()).is_none() {
            return Err(VerifyError::OutsideHeap {
                holder,
                target: target.addr(),
            });
        }
        if !self.is_live(target) {
            return Err(VerifyError::NotAllocated {
                holder,
                target: target.addr(),
            });
        }
        if !self.model.is_valid(target) {
            return Err(VerifyError::CorruptHeader(target.addr()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("end", &format_args!("{:#x}", self.end))
            .field("main_space", &self.main_space)
            .field("bump_space", &self.bump_space)
            .field("region_space", &self.region_space)
            .field("immune_space", &self.immune_space)
            .finish_non_exhaustive()
    }
}
