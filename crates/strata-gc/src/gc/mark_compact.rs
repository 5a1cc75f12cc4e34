//! Stop-the-world mark-compact.
//!
//! Runs entirely inside one suspend-all pause:
//!
//! 1. Revoke TLABs, bind the immune region, process cards.
//! 2. Mark from every root and the mod-union table, then process references.
//! 3. Sweep the non-moving main space.
//! 4. Compute forwarding addresses. Bump-pointer survivors slide toward the
//!    start of their space in address order; region survivors in regions
//!    chosen for evacuation are copied into fresh regions.
//! 5. Rewrite every root and every reference field of a surviving object,
//!    plus the cached slots of the mod-union table.
//! 6. Move the objects and release what they left behind.

use std::ptr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::error::heap_corruption;
use crate::gc::mark_sweep::{begin_marking, finish, record_references, sweep_main_space};
use crate::gc::marker::Marker;
use crate::gc::sync::{ordered, LockOrder};
use crate::heap::Heap;
use crate::metrics::{GcMetrics, PhaseTimer};
use crate::object::{align_object_size, ObjectRef, ReferenceKind, Slot};
use crate::space::ContinuousSpace;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, trace_phase, GcPhase};

/// One object to move: old address, new address, aligned size.
#[derive(Debug, Clone, Copy)]
struct Move {
    from: ObjectRef,
    to: ObjectRef,
    size: usize,
}

pub(crate) struct MarkCompact<'h> {
    heap: &'h Heap,
    metrics: GcMetrics,
    timer: PhaseTimer,
}

impl<'h> MarkCompact<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            metrics: GcMetrics::new(),
            timer: PhaseTimer::new(),
        }
    }

    pub(crate) fn run(mut self, clear_soft_references: bool) -> GcMetrics {
        let heap = self.heap;
        let pause = Instant::now();
        let world = heap.threads.suspend_all(heap.config.checkpoint_timeout);

        self.timer.start();
        let resizes_before = ordered(LockOrder::MarkStack, || heap.mark_stack.lock()).resizes();
        let marker = {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Initialize);
            heap.revoke_tlabs();
            let marker = Marker::new(heap, heap.bind_immune_spaces());
            begin_marking(heap);
            heap.process_cards();
            marker
        };
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

        self.timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Sweep);
            let _bitmaps = heap.bitmap_write();
            heap.marking_active.store(false, Ordering::Release);
            let (objects, bytes) = sweep_main_space(heap);
            self.metrics.objects_freed += objects;
            self.metrics.bytes_freed += bytes;
        }
        self.timer.end_sweep();

        self.timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Compact);
            // Mutators are parked, so nothing allocates; the bitmap lock
            // stays free for the root walk, which takes the registry lock.
            self.compact();
        }
        self.timer.end_compact();

        finish(heap, &marker, resizes_before, &mut self.metrics);
        drop(world);
        self.metrics.record_pause(pause);
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_pause("mark_compact", pause.elapsed());
        self.timer.apply(&mut self.metrics);
        self.metrics
    }

    fn compact(&mut self) {
        let heap = self.heap;
        let bump_moves = self.plan_bump_space();
        let region_moves = self.plan_region_space();

        let forwarding: FxHashMap<ObjectRef, ObjectRef> = bump_moves
            .iter()
            .chain(&region_moves)
            .filter(|m| m.from != m.to)
            .map(|m| (m.from, m.to))
            .collect();
        let forward = |obj: ObjectRef| forwarding.get(&obj).copied();
        self.update_references(&forward);

        for m in &bump_moves {
            if m.from != m.to {
                // SAFETY: both ranges lie in the bump-pointer space and the
                // destination never passes the source; `ptr::copy` allows
                // the overlap.
                unsafe { ptr::copy(m.from.as_ptr(), m.to.as_ptr(), m.size) };
                self.record_move(m.size);
            }
        }
        if let Some(bump) = &heap.bump_space {
            let objects_before = bump.objects_allocated();
            let used: usize = bump_moves.iter().map(|m| m.size).sum();
            let old_end = bump.reset_after_compaction(used, bump_moves.len());
            let new_end = bump.end();
            bump.release_range(new_end, old_end);
            bump.mark_bitmap().clear_all();
            self.metrics.objects_freed += objects_before.saturating_sub(bump_moves.len());
            self.metrics.bytes_freed += old_end - new_end;
        }

        for m in &region_moves {
            // SAFETY: evacuation regions are disjoint from from-space regions.
            unsafe { ptr::copy_nonoverlapping(m.from.as_ptr(), m.to.as_ptr(), m.size) };
            self.record_move(m.size);
        }
        if let Some(region) = &heap.region_space {
            let cleared = region.clear_from_space();
            region.mark_bitmap().clear_all();
            let evacuated_bytes: usize = region_moves.iter().map(|m| m.size).sum();
            self.metrics.regions_freed += cleared.regions;
            self.metrics.objects_freed += cleared.objects.saturating_sub(region_moves.len());
            self.metrics.bytes_freed += cleared.bytes.saturating_sub(evacuated_bytes);
        }

        #[cfg(feature = "tracing")]
        {
            crate::gc::tracing::log_compaction(
                self.metrics.objects_moved,
                self.metrics.bytes_moved,
                self.metrics.bytes_freed,
            );
            log_phase_end(GcPhase::Compact, self.metrics.objects_moved, self.metrics.bytes_moved);
        }
    }

    fn record_move(&mut self, size: usize) {
        self.metrics.objects_moved += 1;
        self.metrics.bytes_moved += size;
    }

    /// Slides marked bump-pointer objects to the front, in address order.
    fn plan_bump_space(&self) -> Vec<Move> {
        let Some(bump) = &self.heap.bump_space else {
            return Vec::new();
        };
        let model = &*self.heap.model;
        let mut moves = Vec::new();
        let mut dest = bump.compaction_start();
        bump.mark_bitmap().visit_marked_range(bump.begin(), bump.end(), |from| {
            let size = align_object_size(model.size_of(from));
            let Some(to) = ObjectRef::new(dest) else {
                heap_corruption!("null forwarding address in {}", bump.name());
            };
            moves.push(Move { from, to, size });
            dest += size;
        });
        moves
    }

    /// Picks the regions to evacuate and reserves a new home for every
    /// marked object in them.
    fn plan_region_space(&mut self) -> Vec<Move> {
        let heap = self.heap;
        let Some(region) = &heap.region_space else {
            return Vec::new();
        };
        let summary = region.set_from_space(heap.config.evacuate_live_ratio);
        self.metrics.regions_evacuated += summary.evacuated;
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_region_classification(summary.evacuated, summary.unevacuated, summary.dead);

        let model = &*heap.model;
        let mut moves = Vec::new();
        region.mark_bitmap().walk(|from| {
            if !region.is_in_from_space(from.addr()) {
                return;
            }
            let size = align_object_size(model.size_of(from));
            let Some(to) = region.alloc_evacuation(size) else {
                heap_corruption!("{}: no room to evacuate {from:?} ({size} bytes)", region.name());
            };
            moves.push(Move { from, to, size });
        });
        moves
    }

    /// Rewrites roots and the fields of every surviving object to point at
    /// forwarded addresses. Objects are still at their old addresses.
    fn update_references(&self, forward: &dyn Fn(ObjectRef) -> Option<ObjectRef>) {
        let heap = self.heap;
        let model = &*heap.model;
        heap.update_roots(forward);

        let update_slot = |slot: Slot| {
            if let Some(new) = slot.load().and_then(forward) {
                slot.store(Some(new));
            }
        };
        let update_object = |obj: ObjectRef| {
            model.visit_references(obj, &mut |slot| update_slot(slot));
            if model.reference_kind(obj) != ReferenceKind::None {
                update_slot(model.pending_next_slot(obj));
            }
        };
        // After the sweep the main space's live bitmap holds its marks.
        heap.main_space.bitmaps().live().walk(&update_object);
        if let Some(bump) = &heap.bump_space {
            bump.mark_bitmap().walk(&update_object);
        }
        if let Some(region) = &heap.region_space {
            region.mark_bitmap().walk(&update_object);
        }
        if let Some(table) = &heap.mod_union {
            table.update_references(forward);
        }
    }
}
