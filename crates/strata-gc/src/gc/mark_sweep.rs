//! Mark-sweep, concurrent or paused.
//!
//! The concurrent cycle marks from a root checkpoint while mutators run,
//! precleans aged cards, then stops the world once to remark roots and cards
//! dirtied since. Reference processing and the sweep run with mutators
//! resumed; `get_referent` takes its slow path in between.
//!
//! The paused cycle runs the same phases with the world stopped throughout.
//!
//! Neither variant moves objects. The main space is swept object by object;
//! region space regions with no live bytes are freed whole; the bump-pointer
//! space only has its marks cleared and waits for a compaction.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::gc::card_table::CARD_AGED;
use crate::gc::mark::HeapBitmap;
use crate::gc::marker::Marker;
use crate::gc::reference::ReferenceStats;
use crate::gc::sync::{ordered, LockOrder};
use crate::heap::Heap;
use crate::metrics::{GcMetrics, PhaseTimer};
use crate::space::ContinuousSpace;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, trace_phase, GcPhase};

pub(crate) struct MarkSweep<'h> {
    heap: &'h Heap,
    concurrent: bool,
    metrics: GcMetrics,
    timer: PhaseTimer,
    resizes_before: usize,
}

impl<'h> MarkSweep<'h> {
    pub(crate) fn new(heap: &'h Heap, concurrent: bool) -> Self {
        Self {
            heap,
            concurrent,
            metrics: GcMetrics::new(),
            timer: PhaseTimer::new(),
            resizes_before: 0,
        }
    }

    pub(crate) fn run(mut self, clear_soft_references: bool) -> GcMetrics {
        let marker = if self.concurrent {
            self.run_concurrent(clear_soft_references)
        } else {
            self.run_paused(clear_soft_references)
        };
        finish(self.heap, &marker, self.resizes_before, &mut self.metrics);
        self.timer.apply(&mut self.metrics);
        self.metrics
    }

    fn run_concurrent(&mut self, clear_soft_references: bool) -> Marker<'h> {
        let heap = self.heap;
        let timeout = heap.config.checkpoint_timeout;

        self.timer.start();
        let marker = self.initialize();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::MarkRoots);
            let mut roots = heap.threads.run_checkpoint(timeout);
            roots.extend(heap.non_thread_roots());
            let _bitmaps = heap.bitmap_read();
            marker.mark_roots(&roots);
            self.metrics.mod_union_cards += marker.update_and_mark_mod_union();
        }
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::RecursiveMark);
            let _bitmaps = heap.bitmap_read();
            marker.process_mark_stack();
        }
        for pass in 0..heap.config.preclean_passes {
            self.preclean(&marker, pass);
        }
        self.remark(&marker);
        self.timer.end_mark();

        self.timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::ProcessReferences);
            let _bitmaps = heap.bitmap_read();
            let stats = heap.references.process_references(
                true,
                clear_soft_references,
                heap.config.soft_reference_policy,
                &marker,
            );
            record_references(&mut self.metrics, stats);
        }
        self.timer.end_reference();

        self.sweep();
        marker
    }

    fn run_paused(&mut self, clear_soft_references: bool) -> Marker<'h> {
        let heap = self.heap;
        let pause = Instant::now();
        let world = heap.threads.suspend_all(heap.config.checkpoint_timeout);

        self.timer.start();
        let marker = self.initialize();
        let mut roots = heap.suspended_thread_roots();
        roots.extend(heap.non_thread_roots());
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::RecursiveMark);
            let _bitmaps = heap.bitmap_read();
            marker.mark_roots(&roots);
            self.metrics.mod_union_cards += marker.update_and_mark_mod_union();
            marker.process_mark_stack();
        }
        self.timer.end_mark();

        self.timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::ProcessReferences);
            let _bitmaps = heap.bitmap_read();
            let stats = heap.references.process_references(
                false,
                clear_soft_references,
                heap.config.soft_reference_policy,
                &marker,
            );
            record_references(&mut self.metrics, stats);
        }
        self.timer.end_reference();

        self.sweep();
        drop(world);
        self.metrics.record_pause(pause);
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_pause("mark_sweep", pause.elapsed());
        marker
    }

    /// Binds the immune region, turns on black allocation and processes
    /// the cards left over from mutator writes.
    fn initialize(&mut self) -> Marker<'h> {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Initialize);
        let heap = self.heap;
        self.resizes_before = ordered(LockOrder::MarkStack, || heap.mark_stack.lock()).resizes();
        let marker = Marker::new(heap, heap.bind_immune_spaces());
        begin_marking(heap);
        heap.process_cards();
        marker
    }

    /// Ages the cards, rescans the aged ones and the roots, and drains.
    fn preclean(&mut self, marker: &Marker<'_>, pass: usize) {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::PreClean);
        let heap = self.heap;
        heap.age_cards();
        let mut roots = heap.threads.run_checkpoint(heap.config.checkpoint_timeout);
        roots.extend(heap.non_thread_roots());

        let _bitmaps = heap.bitmap_read();
        let before = marker.objects_marked();
        marker.mark_roots(&roots);
        let cards = marker.scan_dirty_cards(CARD_AGED);
        marker.process_mark_stack();
        self.metrics.preclean_passes += 1;
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_preclean(pass, cards, marker.objects_marked() - before);
        #[cfg(not(feature = "tracing"))]
        let _ = (pass, cards, before);
    }

    /// The one pause of a concurrent cycle.
    fn remark(&mut self, marker: &Marker<'_>) {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Remark);
        let heap = self.heap;
        let pause = Instant::now();
        let world = heap.threads.suspend_all(heap.config.checkpoint_timeout);
        let mut roots = heap.suspended_thread_roots();
        roots.extend(heap.non_thread_roots());
        {
            let _bitmaps = heap.bitmap_read();
            marker.mark_roots(&roots);
            marker.scan_dirty_cards(CARD_AGED);
            marker.process_mark_stack();
        }
        heap.references.enable_slow_path();
        drop(world);
        self.metrics.record_pause(pause);
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_pause("remark", pause.elapsed());
    }

    /// Frees every unmarked object and makes the marks the new live set.
    fn sweep(&mut self) {
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(GcPhase::Sweep);
        self.timer.start();
        let heap = self.heap;
        let _bitmaps = heap.bitmap_write();
        heap.marking_active.store(false, Ordering::Release);

        let (objects, bytes) = sweep_main_space(heap);
        self.metrics.objects_freed += objects;
        self.metrics.bytes_freed += bytes;
        if let Some(bump) = &heap.bump_space {
            bump.mark_bitmap().clear_all();
        }
        if let Some(region) = &heap.region_space {
            let cleared = region.reclaim_dead_regions();
            region.mark_bitmap().clear_all();
            self.metrics.objects_freed += cleared.objects;
            self.metrics.bytes_freed += cleared.bytes;
            self.metrics.regions_freed += cleared.regions;
        }
        self.timer.end_sweep();
        #[cfg(feature = "tracing")]
        log_phase_end(GcPhase::Sweep, self.metrics.objects_freed, self.metrics.bytes_freed);
    }
}

/// Clears region live bytes and starts black allocation. Allocation holds
/// the bitmap lock shared, so none straddles the switch.
pub(crate) fn begin_marking(heap: &Heap) {
    let _bitmaps = heap.bitmap_write();
    if let Some(region) = &heap.region_space {
        region.clear_live_bytes();
    }
    heap.marking_active.store(true, Ordering::Release);
}

/// Frees the main space objects that are live but unmarked, then swaps the
/// bitmaps so the marks become the live set. Caller holds the bitmap lock
/// exclusively. Returns `(objects, bytes)` freed.
pub(crate) fn sweep_main_space(heap: &Heap) -> (usize, usize) {
    let main = &heap.main_space;
    let bitmaps = main.bitmaps();
    let (mut objects, mut bytes) = (0, 0);
    HeapBitmap::sweep_walk(bitmaps.live(), bitmaps.mark(), main.begin(), main.end(), |batch| {
        let (freed_objects, freed_bytes) = main.free_list(batch);
        objects += freed_objects;
        bytes += freed_bytes;
    });
    bitmaps.swap();
    bitmaps.mark().clear_all();
    (objects, bytes)
}

pub(crate) fn record_references(metrics: &mut GcMetrics, stats: ReferenceStats) {
    metrics.soft_references_preserved += stats.soft_preserved;
    metrics.references_cleared += stats.cleared + stats.phantom_cleared;
    metrics.finalizers_enqueued += stats.finalized;
}

/// Copies the marker's counters into `metrics` and empties the mark stack.
pub(crate) fn finish(heap: &Heap, marker: &Marker<'_>, resizes_before: usize, metrics: &mut GcMetrics) {
    let mut stack = ordered(LockOrder::MarkStack, || heap.mark_stack.lock());
    metrics.mark_stack_resizes = stack.resizes() - resizes_before;
    stack.reset();
    metrics.objects_marked = marker.objects_marked();
    metrics.cards_scanned = marker.cards_scanned();
}
