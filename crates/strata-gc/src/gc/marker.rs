//! Marking: setting mark bits, scanning gray objects and rescanning cards.
//!
//! A [`Marker`] lives for one cycle. Serial draining goes through the heap's
//! mark stack. Once the gray set or the dirty card set is large enough, work
//! moves to scoped worker threads that share a segmented queue and keep a
//! private gray segment each, spilling half of it whenever it outgrows the
//! configured segment capacity.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::error::heap_corruption;
use crate::gc::card_table::CARD_SIZE;
use crate::gc::immune::ImmuneRegion;
use crate::gc::reference::ReferenceCollector;
use crate::gc::sync::{ordered, LockOrder};
use crate::heap::Heap;
use crate::object::{ObjectKind, ObjectRef};
use crate::space::{ContinuousSpace, SpaceId};

/// Cards handed to one parallel card-scanning task.
const CARDS_PER_TASK: usize = 256;

/// A unit of parallel marking work.
enum Task {
    /// Gray objects to scan.
    Objects(Vec<ObjectRef>),
    /// Marked objects on cards of at least `min_age` in `[begin, end)`.
    Cards {
        space: SpaceId,
        begin: usize,
        end: usize,
        min_age: u8,
    },
}

pub(crate) struct Marker<'h> {
    heap: &'h Heap,
    immune: ImmuneRegion,
    marked: AtomicUsize,
    cards_scanned: AtomicUsize,
}

impl<'h> Marker<'h> {
    pub(crate) fn new(heap: &'h Heap, immune: ImmuneRegion) -> Self {
        Self {
            heap,
            immune,
            marked: AtomicUsize::new(0),
            cards_scanned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn objects_marked(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }

    pub(crate) fn cards_scanned(&self) -> usize {
        self.cards_scanned.load(Ordering::Relaxed)
    }

    pub(crate) fn is_marked(&self, obj: ObjectRef) -> bool {
        self.immune.contains(obj.addr()) || self.heap.is_marked(obj)
    }

    /// Sets the mark bit of `obj`. Returns `true` only for the caller that
    /// turned it from white to gray.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the heap or has a corrupt header.
    pub(crate) fn mark(&self, obj: ObjectRef) -> bool {
        if self.immune.contains(obj.addr()) {
            return false;
        }
        let Some(space) = self.heap.space_of(obj.addr()) else {
            heap_corruption!("marking {obj:?}, which is outside the heap");
        };
        if self.heap.mark_bitmap(space).atomic_test_and_set(obj) {
            return false;
        }
        if !self.heap.model.is_valid(obj) {
            heap_corruption!("marking {obj:?}, which has a corrupt header");
        }
        if space == SpaceId::Region {
            if let Some(region) = &self.heap.region_space {
                region.add_live_bytes(obj, self.heap.model.size_of(obj));
            }
        }
        self.marked.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Marks `obj` and pushes it on the serial mark stack if it was white.
    pub(crate) fn mark_and_push(&self, obj: ObjectRef) {
        if self.mark(obj) {
            ordered(LockOrder::MarkStack, || self.heap.mark_stack.lock()).push(obj);
        }
    }

    /// Marks every root.
    pub(crate) fn mark_roots(&self, roots: &[ObjectRef]) {
        let mut stack = ordered(LockOrder::MarkStack, || self.heap.mark_stack.lock());
        for &root in roots {
            if self.mark(root) {
                stack.push(root);
            }
        }
    }

    /// Marks the referents of one gray object and hands the newly gray ones
    /// to `push`. A reference object's referent is left to the reference
    /// processor.
    fn scan_object(&self, obj: ObjectRef, push: &mut dyn FnMut(ObjectRef)) {
        let model = &*self.heap.model;
        match model.classify(obj) {
            ObjectKind::Scalar => {}
            ObjectKind::Array | ObjectKind::Container => model.visit_references(obj, &mut |slot| {
                if let Some(target) = slot.load() {
                    if self.mark(target) {
                        push(target);
                    }
                }
            }),
            ObjectKind::Reference(kind) => {
                let referent = model.referent_slot(obj).addr();
                model.visit_references(obj, &mut |slot| {
                    if slot.addr() == referent {
                        return;
                    }
                    if let Some(target) = slot.load() {
                        if self.mark(target) {
                            push(target);
                        }
                    }
                });
                self.heap
                    .references
                    .delay_reference_referent(kind, obj, |r| self.is_marked(r));
            }
        }
    }

    /// Drains the gray set.
    pub(crate) fn process_mark_stack(&self) {
        let parallel = &self.heap.config.parallel;
        let mut stack = ordered(LockOrder::MarkStack, || self.heap.mark_stack.lock());
        if parallel.use_parallel() && stack.len() >= parallel.parallel_threshold {
            let gray = stack.take_all();
            drop(stack);
            self.run_parallel(vec![Task::Objects(gray)]);
            return;
        }
        while let Some(obj) = stack.pop() {
            self.scan_object(obj, &mut |target| stack.push(target));
        }
    }

    /// Scans the marked objects on every card of at least `min_age`, in
    /// every space. Immune objects are found through their live bitmap.
    /// Newly gray objects are left for [`process_mark_stack`](Self::process_mark_stack)
    /// unless the scan runs in parallel, which drains them itself.
    ///
    /// Returns the number of cards scanned.
    pub(crate) fn scan_dirty_cards(&self, min_age: u8) -> usize {
        let ranges: Vec<(SpaceId, usize, usize)> = self
            .heap
            .spaces()
            .map(|space| (space.id(), space.begin(), space.end()))
            .collect();
        let parallel = &self.heap.config.parallel;
        let before = self.cards_scanned();

        let dirty: usize = ranges
            .iter()
            .map(|&(_, begin, end)| self.heap.card_table.count_cards(begin, end, min_age))
            .sum();
        if parallel.use_parallel() && dirty >= parallel.parallel_threshold {
            let chunk = CARDS_PER_TASK * CARD_SIZE;
            let mut tasks = Vec::new();
            for (space, begin, end) in ranges {
                let mut start = begin;
                while start < end {
                    let stop = (start + chunk).min(end);
                    tasks.push(Task::Cards {
                        space,
                        begin: start,
                        end: stop,
                        min_age,
                    });
                    start = stop;
                }
            }
            self.run_parallel(tasks);
        } else {
            let mut stack = ordered(LockOrder::MarkStack, || self.heap.mark_stack.lock());
            for (space, begin, end) in ranges {
                self.scan_cards(space, begin, end, min_age, &mut |obj| stack.push(obj));
            }
        }
        self.cards_scanned() - before
    }

    fn scan_cards(&self, space: SpaceId, begin: usize, end: usize, min_age: u8, push: &mut dyn FnMut(ObjectRef)) {
        let bitmap = self.heap.scan_bitmap(space);
        let cards = self
            .heap
            .card_table
            .scan(bitmap, begin, end, min_age, |obj| self.scan_object(obj, &mut *push));
        self.cards_scanned.fetch_add(cards, Ordering::Relaxed);
    }

    /// Rescans the immune space's recorded cards and marks every
    /// collectible object they reference. Returns the cards rescanned.
    pub(crate) fn update_and_mark_mod_union(&self) -> usize {
        let (Some(table), Some(space)) = (&self.heap.mod_union, &self.heap.immune_space) else {
            return 0;
        };
        let Some(live) = space.live_bitmap() else {
            return 0;
        };
        let cards = table.update_and_mark_references(
            live,
            &*self.heap.model,
            |target| !self.immune.contains(target.addr()),
            |target| self.mark_and_push(target),
        );
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_mod_union(table.name(), cards);
        cards
    }

    fn run_parallel(&self, tasks: Vec<Task>) {
        let workers = self.heap.config.parallel.effective_workers();
        let queue = SegQueue::new();
        for task in tasks {
            queue.push(task);
        }
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_parallel_mark(workers, queue.len());
        let active = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.parallel_worker(&queue, &active));
            }
        });
    }

    fn parallel_worker(&self, queue: &SegQueue<Task>, active: &AtomicUsize) {
        let segment = self.heap.config.parallel.segment_capacity.max(2);
        let mut local: Vec<ObjectRef> = Vec::with_capacity(segment);
        loop {
            // Announce before popping so an idle worker never sees an empty
            // queue and zero active workers while this one holds a task.
            active.fetch_add(1, Ordering::SeqCst);
            let Some(task) = queue.pop() else {
                active.fetch_sub(1, Ordering::SeqCst);
                if active.load(Ordering::SeqCst) == 0 && queue.is_empty() {
                    break;
                }
                std::thread::yield_now();
                continue;
            };
            match task {
                Task::Objects(gray) => local.extend(gray),
                Task::Cards {
                    space,
                    begin,
                    end,
                    min_age,
                } => self.scan_cards(space, begin, end, min_age, &mut |obj| local.push(obj)),
            }
            while let Some(obj) = local.pop() {
                self.scan_object(obj, &mut |target| local.push(target));
                if local.len() > segment {
                    let spill = local.split_off(local.len() / 2);
                    queue.push(Task::Objects(spill));
                }
            }
            active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ReferenceCollector for Marker<'_> {
    fn is_marked(&self, obj: ObjectRef) -> bool {
        Marker::is_marked(self, obj)
    }

    fn mark_and_push(&self, obj: ObjectRef) {
        Marker::mark_and_push(self, obj);
    }

    fn process_mark_stack(&self) {
        Marker::process_mark_stack(self);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{HeapConfig, ParallelMarkConfig};
    use crate::simple::SimpleObjectModel;

    fn heap(parallel: ParallelMarkConfig) -> (Arc<Heap>, Arc<SimpleObjectModel>) {
        let model = Arc::new(SimpleObjectModel::new());
        let config = HeapConfig::default()
            .with_main_capacity(4 << 20)
            .with_bump_capacity(0)
            .with_regions(1 << 20, 64 << 10)
            .with_parallel(parallel);
        (Heap::new(config, model.clone()).unwrap(), model)
    }

    /// A linked list of `len` containers in the main space.
    fn chain(heap: &Heap, model: &SimpleObjectModel, len: usize) -> Vec<ObjectRef> {
        let nodes: Vec<ObjectRef> = (0..len)
            .map(|_| {
                let obj = heap
                    .try_allocate(None, SpaceId::Main, SimpleObjectModel::object_size(1, 8))
                    .unwrap()
                    .unwrap();
                model.init_object(obj, ObjectKind::Container, 1, 8);
                obj
            })
            .collect();
        for pair in nodes.windows(2) {
            heap.write_reference(pair[0], model.field(pair[0], 0), Some(pair[1]));
        }
        nodes
    }

    #[test]
    fn test_mark_is_exclusive() {
        let (heap, model) = heap(ParallelMarkConfig::default());
        let nodes = chain(&heap, &model, 1);
        let marker = Marker::new(&heap, heap.bind_immune_spaces());
        assert!(marker.mark(nodes[0]));
        assert!(!marker.mark(nodes[0]));
        assert_eq!(marker.objects_marked(), 1);
    }

    #[test]
    fn test_serial_drain_marks_whole_chain() {
        let (heap, model) = heap(ParallelMarkConfig::default());
        let nodes = chain(&heap, &model, 100);
        let marker = Marker::new(&heap, heap.bind_immune_spaces());
        marker.mark_roots(&nodes[..1]);
        marker.process_mark_stack();
        assert!(nodes.iter().all(|&n| heap.is_marked(n)));
        assert_eq!(marker.objects_marked(), 100);
    }

    #[test]
    fn test_parallel_drain_matches_serial() {
        let mut parallel = ParallelMarkConfig::new(4);
        parallel.set_parallel_threshold(1);
        parallel.set_segment_capacity(4);
        let (heap, model) = heap(parallel);
        let heads: Vec<ObjectRef> = (0..32).map(|_| chain(&heap, &model, 40)[0]).collect();
        let marker = Marker::new(&heap, heap.bind_immune_spaces());
        marker.mark_roots(&heads);
        marker.process_mark_stack();
        assert_eq!(marker.objects_marked(), 32 * 40);
        assert_eq!(heap.main_space().bitmaps().mark().count_marked(), 32 * 40);
    }

    #[test]
    fn test_card_scan_finds_objects_on_dirty_cards() {
        let (heap, model) = heap(ParallelMarkConfig::default());
        let nodes = chain(&heap, &model, 3);
        heap.process_cards();
        let marker = Marker::new(&heap, heap.bind_immune_spaces());
        marker.mark(nodes[0]);
        heap.write_reference(nodes[0], model.field(nodes[0], 0), Some(nodes[2]));
        let cards = marker.scan_dirty_cards(crate::gc::CARD_DIRTY);
        assert!(cards >= 1);
        marker.process_mark_stack();
        assert!(heap.is_marked(nodes[2]));
        assert!(!heap.is_marked(nodes[1]));
    }

    #[test]
    fn test_region_marking_credits_live_bytes() {
        let (heap, model) = heap(ParallelMarkConfig::default());
        let size = SimpleObjectModel::object_size(0, 24);
        let obj = heap.try_allocate(None, SpaceId::Region, size).unwrap().unwrap();
        model.init_object(obj, ObjectKind::Scalar, 0, 24);
        let marker = Marker::new(&heap, heap.bind_immune_spaces());
        marker.mark(obj);
        let region = heap.region_space().unwrap().region_of(obj.addr());
        assert_eq!(region.live_bytes, size);
    }

    #[test]
    #[should_panic(expected = "outside the heap")]
    fn test_marking_outside_heap_panics() {
        let (heap, _) = heap(ParallelMarkConfig::default());
        let marker = Marker::new(&heap, heap.bind_immune_spaces());
        marker.mark(ObjectRef::new(0x10).unwrap());
    }
}
