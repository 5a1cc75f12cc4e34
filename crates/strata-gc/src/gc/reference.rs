//! Reference queues and the reference processor.
//!
//! Reference objects whose referent is still white when the marker reaches
//! them are parked on one of four queues by kind. After marking, the
//! processor decides per queue whether the referent survives, clears the
//! rest, and moves the cleared references to the cleared queue for the
//! runtime to pick up.
//!
//! Queues are intrusive circular lists threaded through each reference's
//! `pending_next` slot; the queue itself stores only the list tail. A
//! reference is on at most one queue, exactly when its `pending_next` is
//! non-null.
//!
//! While a concurrent cycle processes references, `get_referent` takes a
//! slow path so mutators cannot resurrect a referent that is about to be
//! cleared.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::SoftReferencePolicy;
use crate::error::heap_corruption;
use crate::gc::sync::{ordered, LockOrder};
use crate::object::{ObjectModel, ObjectRef, ReferenceKind};

/// What a collector provides to reference processing.
pub trait ReferenceCollector {
    /// Whether `obj` is marked (immune objects count as marked).
    fn is_marked(&self, obj: ObjectRef) -> bool;

    /// Marks `obj` and schedules it for scanning.
    fn mark_and_push(&self, obj: ObjectRef);

    /// Drains the gray set.
    fn process_mark_stack(&self);
}

/// A circular list of reference objects linked through `pending_next`.
pub struct ReferenceQueue {
    name: &'static str,
    list: Mutex<Option<ObjectRef>>,
}

impl ReferenceQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            list: Mutex::new(None),
        }
    }

    /// Queue name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the queue holds no reference.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        ordered(LockOrder::ReferenceQueue, || self.list.lock()).is_none()
    }

    /// Number of queued references.
    #[must_use]
    pub fn len(&self, model: &dyn ObjectModel) -> usize {
        let list = ordered(LockOrder::ReferenceQueue, || self.list.lock());
        let mut count = 0;
        Self::for_each(**list, model, |_| count += 1);
        count
    }

    fn for_each(list: Option<ObjectRef>, model: &dyn ObjectModel, mut visitor: impl FnMut(ObjectRef)) {
        let Some(tail) = list else { return };
        let mut current = tail;
        loop {
            let Some(next) = model.pending_next_slot(current).load() else {
                heap_corruption!("reference {current:?} queued without a link");
            };
            visitor(next);
            if next == tail {
                return;
            }
            current = next;
        }
    }

    /// Links `reference` in as the new tail. Lock held.
    fn enqueue_locked(list: &mut Option<ObjectRef>, model: &dyn ObjectModel, reference: ObjectRef) {
        let link = model.pending_next_slot(reference);
        match *list {
            None => {
                link.store(Some(reference));
                *list = Some(reference);
            }
            Some(tail) => {
                let tail_link = model.pending_next_slot(tail);
                link.store(tail_link.load());
                tail_link.store(Some(reference));
                *list = Some(reference);
            }
        }
    }

    /// Adds `reference` to the queue.
    pub fn enqueue(&self, model: &dyn ObjectModel, reference: ObjectRef) {
        let mut list = ordered(LockOrder::ReferenceQueue, || self.list.lock());
        Self::enqueue_locked(&mut list, model, reference);
    }

    /// Adds `reference` unless it is already on some queue.
    ///
    /// Returns whether it was added. Safe against concurrent markers
    /// discovering the same reference.
    pub fn atomic_enqueue_if_not_enqueued(&self, model: &dyn ObjectModel, reference: ObjectRef) -> bool {
        let mut list = ordered(LockOrder::ReferenceQueue, || self.list.lock());
        if model.pending_next_slot(reference).load().is_some() {
            return false;
        }
        Self::enqueue_locked(&mut list, model, reference);
        true
    }

    /// Removes the oldest reference and nulls its link.
    pub fn dequeue(&self, model: &dyn ObjectModel) -> Option<ObjectRef> {
        let mut list = ordered(LockOrder::ReferenceQueue, || self.list.lock());
        let tail = (**list)?;
        let tail_link = model.pending_next_slot(tail);
        let Some(head) = tail_link.load() else {
            heap_corruption!("{} queue tail {tail:?} has no link", self.name);
        };
        if head == tail {
            **list = None;
        } else {
            tail_link.store(model.pending_next_slot(head).load());
        }
        model.pending_next_slot(head).store(None);
        Some(head)
    }

    /// Visits every queued reference without dequeuing.
    pub fn visit(&self, model: &dyn ObjectModel, visitor: impl FnMut(ObjectRef)) {
        let list = ordered(LockOrder::ReferenceQueue, || self.list.lock());
        Self::for_each(**list, model, visitor);
    }

    /// Rewrites the stored tail through `update`.
    ///
    /// The links themselves live in the references and are rewritten with
    /// the rest of their fields.
    pub fn update_root(&self, update: impl FnOnce(ObjectRef) -> Option<ObjectRef>) {
        let mut list = ordered(LockOrder::ReferenceQueue, || self.list.lock());
        if let Some(tail) = **list {
            if let Some(new) = update(tail) {
                **list = Some(new);
            }
        }
    }

    /// Clears every reference whose referent is white and moves the
    /// enqueueable ones to `cleared`. Returns how many were cleared.
    fn clear_white_references(
        &self,
        cleared: &Self,
        model: &dyn ObjectModel,
        collector: &dyn ReferenceCollector,
    ) -> usize {
        let mut count = 0;
        while let Some(reference) = self.dequeue(model) {
            let referent = model.referent_slot(reference);
            if referent.load().is_some_and(|r| !collector.is_marked(r)) {
                referent.store(None);
                count += 1;
                if model.has_queue(reference) {
                    cleared.enqueue(model, reference);
                }
            }
        }
        count
    }

    /// Keeps white finalizer referents alive in the zombie slot and
    /// schedules their references. Returns how many were enqueued.
    fn enqueue_finalizer_references(
        &self,
        cleared: &Self,
        model: &dyn ObjectModel,
        collector: &dyn ReferenceCollector,
    ) -> usize {
        let mut count = 0;
        while let Some(reference) = self.dequeue(model) {
            let referent = model.referent_slot(reference);
            if let Some(target) = referent.load().filter(|r| !collector.is_marked(*r)) {
                collector.mark_and_push(target);
                model.zombie_slot(reference).store(Some(target));
                referent.store(None);
                cleared.enqueue(model, reference);
                count += 1;
            }
        }
        count
    }
}

impl std::fmt::Debug for ReferenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceQueue")
            .field("name", &self.name)
            .field("list", &*self.list.lock())
            .finish()
    }
}

/// Outcome of one `process_references` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    /// Soft referents kept alive by the preservation policy.
    pub soft_preserved: usize,
    /// Soft and weak references cleared.
    pub cleared: usize,
    /// Finalizer references whose referent moved to the zombie slot.
    pub finalized: usize,
    /// Phantom references cleared.
    pub phantom_cleared: usize,
}

struct ProcessorState {
    preserving: bool,
}

/// The four processing queues, the cleared queue and the `get_referent`
/// slow path.
pub struct ReferenceProcessor {
    model: Arc<dyn ObjectModel>,
    soft: ReferenceQueue,
    weak: ReferenceQueue,
    finalizer: ReferenceQueue,
    phantom: ReferenceQueue,
    cleared: ReferenceQueue,
    slow_path: AtomicBool,
    state: Mutex<ProcessorState>,
    condition: Condvar,
    soft_counter: AtomicUsize,
}

impl ReferenceProcessor {
    /// Creates a processor with empty queues.
    #[must_use]
    pub fn new(model: Arc<dyn ObjectModel>) -> Self {
        Self {
            model,
            soft: ReferenceQueue::new("soft"),
            weak: ReferenceQueue::new("weak"),
            finalizer: ReferenceQueue::new("finalizer"),
            phantom: ReferenceQueue::new("phantom"),
            cleared: ReferenceQueue::new("cleared"),
            slow_path: AtomicBool::new(false),
            state: Mutex::new(ProcessorState { preserving: false }),
            condition: Condvar::new(),
            soft_counter: AtomicUsize::new(0),
        }
    }

    /// The queue holding references of `kind`.
    ///
    /// # Panics
    ///
    /// Panics on `ReferenceKind::None`.
    #[must_use]
    pub fn queue(&self, kind: ReferenceKind) -> &ReferenceQueue {
        match kind {
            ReferenceKind::Soft => &self.soft,
            ReferenceKind::Weak => &self.weak,
            ReferenceKind::Finalizer => &self.finalizer,
            ReferenceKind::Phantom => &self.phantom,
            ReferenceKind::None => heap_corruption!("not a reference kind: {kind:?}"),
        }
    }

    /// The queue of cleared references awaiting the runtime.
    #[must_use]
    pub const fn cleared_queue(&self) -> &ReferenceQueue {
        &self.cleared
    }

    /// Called by the marker for every reference object it scans. A white
    /// referent parks the reference on its kind's queue.
    ///
    /// # Panics
    ///
    /// Panics when `kind` is `ReferenceKind::None`.
    pub fn delay_reference_referent(
        &self,
        kind: ReferenceKind,
        reference: ObjectRef,
        is_marked: impl Fn(ObjectRef) -> bool,
    ) {
        let queue = self.queue(kind);
        let referent = self.model.referent_slot(reference).load();
        if referent.is_some_and(|r| !is_marked(r)) {
            queue.atomic_enqueue_if_not_enqueued(&*self.model, reference);
        }
    }

    /// Whether `get_referent` currently takes the slow path.
    #[must_use]
    pub fn slow_path_enabled(&self) -> bool {
        self.slow_path.load(Ordering::Acquire)
    }

    /// Makes `get_referent` block until processing is done. Called in the
    /// final pause of a concurrent cycle.
    pub fn enable_slow_path(&self) {
        self.slow_path.store(true, Ordering::Release);
    }

    /// Releases every reader blocked in [`get_referent`](Self::get_referent).
    pub(crate) fn disable_slow_path(&self) {
        let _state = ordered(LockOrder::ReferenceProcessor, || self.state.lock());
        self.slow_path.store(false, Ordering::Release);
        self.condition.notify_all();
    }

    fn set_preserving(&self, preserving: bool) {
        let mut state = ordered(LockOrder::ReferenceProcessor, || self.state.lock());
        state.preserving = preserving;
        if !preserving {
            self.condition.notify_all();
        }
    }

    /// Reads the referent of `reference`, waiting for a concurrent cycle to
    /// decide its fate first.
    ///
    /// While the slow path is enabled a referent that is already marked is
    /// returned immediately, unless the processor is preserving referents
    /// and the reference has been taken off its queue; anything else waits
    /// for processing to finish.
    pub fn get_referent(
        &self,
        reference: ObjectRef,
        is_marked: impl Fn(ObjectRef) -> bool,
    ) -> Option<ObjectRef> {
        let slot = self.model.referent_slot(reference);
        let referent = slot.load();
        if !self.slow_path_enabled() || referent.is_none() {
            return referent;
        }
        let mut state = ordered(LockOrder::ReferenceProcessor, || self.state.lock());
        while self.slow_path_enabled() {
            let referent = slot.load()?;
            if is_marked(referent) {
                let unprocessed = self.model.pending_next_slot(reference).load().is_some();
                let finalizer = self.model.reference_kind(reference) == ReferenceKind::Finalizer;
                if !state.preserving || (!finalizer && unprocessed) {
                    return Some(referent);
                }
            }
            self.condition.wait(&mut *state);
        }
        slot.load()
    }

    /// Processes the four queues after marking completes.
    ///
    /// `concurrent` must match whether the slow path was enabled. On return
    /// the four queues are empty and, for a concurrent cycle, the slow path
    /// is disabled and waiting readers are released.
    ///
    /// # Panics
    ///
    /// Panics if a processing queue is non-empty afterwards.
    pub fn process_references(
        &self,
        concurrent: bool,
        clear_soft_references: bool,
        policy: SoftReferencePolicy,
        collector: &dyn ReferenceCollector,
    ) -> ReferenceStats {
        debug_assert_eq!(
            self.slow_path_enabled(),
            concurrent,
            "slow path must be enabled iff processing is concurrent"
        );
        let model = &*self.model;
        let mut stats = ReferenceStats::default();

        if !clear_soft_references {
            if concurrent {
                self.set_preserving(true);
            }
            stats.soft_preserved = self.preserve_soft_references(policy, collector);
            collector.process_mark_stack();
            if concurrent {
                self.set_preserving(false);
            }
        }

        stats.cleared += self.soft.clear_white_references(&self.cleared, model, collector);
        stats.cleared += self.weak.clear_white_references(&self.cleared, model, collector);

        if concurrent {
            self.set_preserving(true);
        }
        // Marking a zombie can discover further finalizer references.
        while !self.finalizer.is_empty() {
            stats.finalized += self
                .finalizer
                .enqueue_finalizer_references(&self.cleared, model, collector);
            collector.process_mark_stack();
        }
        if concurrent {
            self.set_preserving(false);
        }

        stats.cleared += self.soft.clear_white_references(&self.cleared, model, collector);
        stats.cleared += self.weak.clear_white_references(&self.cleared, model, collector);
        stats.phantom_cleared = self.phantom.clear_white_references(&self.cleared, model, collector);

        for queue in [&self.soft, &self.weak, &self.finalizer, &self.phantom] {
            if !queue.is_empty() {
                heap_corruption!("{} reference queue not empty after processing", queue.name());
            }
        }
        if concurrent {
            self.disable_slow_path();
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            soft_preserved = stats.soft_preserved,
            cleared = stats.cleared,
            finalized = stats.finalized,
            phantom_cleared = stats.phantom_cleared,
            "references_processed"
        );
        stats
    }

    /// Marks the white soft referents the policy keeps. Returns how many.
    fn preserve_soft_references(
        &self,
        policy: SoftReferencePolicy,
        collector: &dyn ReferenceCollector,
    ) -> usize {
        let mut preserved = Vec::new();
        self.soft.visit(&*self.model, |reference| {
            let Some(referent) = self.model.referent_slot(reference).load() else {
                return;
            };
            let keep = match policy {
                SoftReferencePolicy::PreserveAll => true,
                SoftReferencePolicy::ClearAll => false,
                SoftReferencePolicy::Alternate => {
                    self.soft_counter.fetch_add(1, Ordering::Relaxed) % 2 == 0
                }
            };
            if keep {
                preserved.push(referent);
            }
        });
        let count = preserved.len();
        for referent in preserved {
            collector.mark_and_push(referent);
        }
        count
    }

    /// Visits every reference on the cleared queue; they stay reachable
    /// until the runtime takes them.
    pub fn visit_cleared(&self, visitor: impl FnMut(ObjectRef)) {
        self.cleared.visit(&*self.model, visitor);
    }

    /// Rewrites the cleared queue's stored tail after objects moved.
    pub fn update_roots(&self, forward: impl FnOnce(ObjectRef) -> Option<ObjectRef>) {
        self.cleared.update_root(forward);
    }

    /// Drains the cleared queue in enqueue order.
    pub fn take_cleared(&self) -> Vec<ObjectRef> {
        std::iter::from_fn(|| self.cleared.dequeue(&*self.model)).collect()
    }
}

impl std::fmt::Debug for ReferenceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceProcessor")
            .field("slow_path", &self.slow_path_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectKind, Slot};
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Test references are four words: kind, referent, pending_next, zombie.
    /// Kind 0 is a plain object. Bit 8 of the kind word means "has queue".
    struct Refs;

    fn word(obj: ObjectRef, index: usize) -> Slot {
        unsafe { Slot::from_addr(obj.addr() + index * 8) }
    }

    impl ObjectModel for Refs {
        fn size_of(&self, _: ObjectRef) -> usize {
            32
        }
        fn classify(&self, obj: ObjectRef) -> ObjectKind {
            let kind = unsafe { *(obj.addr() as *const usize) } & 0xff;
            match kind {
                1 => ObjectKind::Reference(ReferenceKind::Soft),
                2 => ObjectKind::Reference(ReferenceKind::Weak),
                3 => ObjectKind::Reference(ReferenceKind::Finalizer),
                4 => ObjectKind::Reference(ReferenceKind::Phantom),
                _ => ObjectKind::Scalar,
            }
        }
        fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn FnMut(Slot)) {
            visitor(word(obj, 1));
            visitor(word(obj, 3));
        }
        fn referent_slot(&self, reference: ObjectRef) -> Slot {
            word(reference, 1)
        }
        fn pending_next_slot(&self, reference: ObjectRef) -> Slot {
            word(reference, 2)
        }
        fn zombie_slot(&self, reference: ObjectRef) -> Slot {
            word(reference, 3)
        }
        fn has_queue(&self, reference: ObjectRef) -> bool {
            let kind = unsafe { *(reference.addr() as *const usize) };
            kind & 0x100 != 0
        }
    }

    struct Arena {
        words: Vec<[usize; 4]>,
    }

    impl Arena {
        fn new(n: usize) -> Self {
            Self { words: vec![[0; 4]; n] }
        }

        fn obj(&mut self, index: usize, kind: usize) -> ObjectRef {
            self.words[index][0] = kind;
            ObjectRef::new(self.words[index].as_ptr() as usize).unwrap()
        }
    }

    /// Marks into a set; the mark stack is drained eagerly.
    #[derive(Default)]
    struct SetCollector {
        marked: RefCell<HashSet<ObjectRef>>,
    }

    impl ReferenceCollector for SetCollector {
        fn is_marked(&self, obj: ObjectRef) -> bool {
            self.marked.borrow().contains(&obj)
        }
        fn mark_and_push(&self, obj: ObjectRef) {
            self.marked.borrow_mut().insert(obj);
        }
        fn process_mark_stack(&self) {}
    }

    fn processor() -> ReferenceProcessor {
        ReferenceProcessor::new(Arc::new(Refs))
    }

    #[test]
    fn test_queue_is_fifo_and_nulls_links() {
        let mut arena = Arena::new(3);
        let refs: Vec<_> = (0..3).map(|i| arena.obj(i, 2)).collect();
        let queue = ReferenceQueue::new("weak");
        for r in &refs {
            queue.enqueue(&Refs, *r);
        }
        assert_eq!(queue.len(&Refs), 3);
        for r in &refs {
            assert_eq!(queue.dequeue(&Refs), Some(*r));
            assert_eq!(Refs.pending_next_slot(*r).load(), None);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_atomic_enqueue_skips_queued_reference() {
        let mut arena = Arena::new(1);
        let r = arena.obj(0, 2);
        let queue = ReferenceQueue::new("weak");
        assert!(queue.atomic_enqueue_if_not_enqueued(&Refs, r));
        assert!(!queue.atomic_enqueue_if_not_enqueued(&Refs, r));
        assert_eq!(queue.len(&Refs), 1);
    }

    #[test]
    fn test_white_weak_referent_is_cleared_and_enqueued() {
        let mut arena = Arena::new(3);
        let weak = arena.obj(0, 2 | 0x100);
        let strong_weak = arena.obj(1, 2 | 0x100);
        let referent = arena.obj(2, 0);
        Refs.referent_slot(weak).store(Some(referent));
        Refs.referent_slot(strong_weak).store(Some(weak));

        let rp = processor();
        let collector = SetCollector::default();
        collector.mark_and_push(weak);
        rp.delay_reference_referent(ReferenceKind::Weak, weak, |o| collector.is_marked(o));
        rp.delay_reference_referent(ReferenceKind::Weak, strong_weak, |o| collector.is_marked(o));
        assert_eq!(rp.queue(ReferenceKind::Weak).len(&Refs), 1);

        let stats = rp.process_references(false, true, SoftReferencePolicy::Alternate, &collector);
        assert_eq!(stats.cleared, 1);
        assert_eq!(Refs.referent_slot(weak).load(), None);
        assert_eq!(Refs.referent_slot(strong_weak).load(), Some(weak));
        assert_eq!(rp.take_cleared(), vec![weak]);
    }

    #[test]
    fn test_reference_without_queue_is_cleared_not_enqueued() {
        let mut arena = Arena::new(2);
        let weak = arena.obj(0, 2);
        let referent = arena.obj(1, 0);
        Refs.referent_slot(weak).store(Some(referent));
        let rp = processor();
        let collector = SetCollector::default();
        rp.delay_reference_referent(ReferenceKind::Weak, weak, |o| collector.is_marked(o));
        rp.process_references(false, true, SoftReferencePolicy::Alternate, &collector);
        assert_eq!(Refs.referent_slot(weak).load(), None);
        assert_eq!(Refs.pending_next_slot(weak).load(), None);
        assert!(rp.take_cleared().is_empty());
    }

    #[test]
    fn test_finalizer_referent_moves_to_zombie() {
        let mut arena = Arena::new(2);
        let fin = arena.obj(0, 3 | 0x100);
        let referent = arena.obj(1, 0);
        Refs.referent_slot(fin).store(Some(referent));
        let rp = processor();
        let collector = SetCollector::default();
        rp.delay_reference_referent(ReferenceKind::Finalizer, fin, |o| collector.is_marked(o));

        let stats = rp.process_references(false, true, SoftReferencePolicy::Alternate, &collector);
        assert_eq!(stats.finalized, 1);
        assert!(collector.is_marked(referent));
        assert_eq!(Refs.zombie_slot(fin).load(), Some(referent));
        assert_eq!(Refs.referent_slot(fin).load(), None);
        assert_eq!(rp.take_cleared(), vec![fin]);
    }

    #[test]
    fn test_soft_policy_preserve_all_keeps_referents() {
        let mut arena = Arena::new(4);
        let rp = processor();
        let collector = SetCollector::default();
        let mut softs = Vec::new();
        for i in 0..2 {
            let soft = arena.obj(i * 2, 1);
            let referent = arena.obj(i * 2 + 1, 0);
            Refs.referent_slot(soft).store(Some(referent));
            rp.delay_reference_referent(ReferenceKind::Soft, soft, |o| collector.is_marked(o));
            softs.push((soft, referent));
        }
        let stats = rp.process_references(false, false, SoftReferencePolicy::PreserveAll, &collector);
        assert_eq!(stats.soft_preserved, 2);
        assert_eq!(stats.cleared, 0);
        for (soft, referent) in softs {
            assert_eq!(Refs.referent_slot(soft).load(), Some(referent));
        }
    }

    #[test]
    fn test_soft_policy_alternate_keeps_every_other() {
        let mut arena = Arena::new(8);
        let rp = processor();
        let collector = SetCollector::default();
        for i in 0..4 {
            let soft = arena.obj(i * 2, 1);
            let referent = arena.obj(i * 2 + 1, 0);
            Refs.referent_slot(soft).store(Some(referent));
            rp.delay_reference_referent(ReferenceKind::Soft, soft, |o| collector.is_marked(o));
        }
        let stats = rp.process_references(false, false, SoftReferencePolicy::Alternate, &collector);
        assert_eq!(stats.soft_preserved, 2);
        assert_eq!(stats.cleared, 2);
    }

    #[test]
    fn test_phantom_cleared_after_finalization() {
        let mut arena = Arena::new(2);
        let phantom = arena.obj(0, 4 | 0x100);
        let referent = arena.obj(1, 0);
        Refs.referent_slot(phantom).store(Some(referent));
        let rp = processor();
        let collector = SetCollector::default();
        rp.delay_reference_referent(ReferenceKind::Phantom, phantom, |o| collector.is_marked(o));
        let stats = rp.process_references(false, true, SoftReferencePolicy::Alternate, &collector);
        assert_eq!(stats.phantom_cleared, 1);
        assert_eq!(rp.take_cleared(), vec![phantom]);
    }

    #[test]
    #[should_panic(expected = "not a reference kind")]
    fn test_delay_with_none_kind_panics() {
        let mut arena = Arena::new(1);
        let obj = arena.obj(0, 0);
        processor().delay_reference_referent(ReferenceKind::None, obj, |_| false);
    }

    #[test]
    fn test_get_referent_fast_path_when_disabled() {
        let mut arena = Arena::new(2);
        let weak = arena.obj(0, 2);
        let referent = arena.obj(1, 0);
        Refs.referent_slot(weak).store(Some(referent));
        let rp = processor();
        assert_eq!(rp.get_referent(weak, |_| false), Some(referent));
    }

    #[test]
    fn test_get_referent_marked_returns_during_slow_path() {
        let mut arena = Arena::new(2);
        let weak = arena.obj(0, 2);
        let referent = arena.obj(1, 0);
        Refs.referent_slot(weak).store(Some(referent));
        let rp = processor();
        rp.enable_slow_path();
        assert_eq!(rp.get_referent(weak, |_| true), Some(referent));
    }
}
