//! Mutator handles.
//!
//! A [`Mutator`] is one thread's view of the heap. It owns a root table and
//! a TLAB, answers checkpoint requests at safepoints, and parks when the
//! collector stops the world. Every allocation is a safepoint.
//!
//! An [`ObjectRef`] returned by a mutator is only valid until that mutator's
//! next safepoint, because mark-compact may move the object. Anything that
//! must survive a safepoint belongs in a root.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::error::{AllocError, VerifyError};
use crate::gc::checkpoint::{service_requests, MutatorRecord, Request};
use crate::gc::sync::{ordered, LockOrder};
use crate::heap::{GcKind, Heap};
use crate::metrics::GcMetrics;
use crate::object::{ObjectRef, Slot};
use crate::roots::RootHandle;
use crate::space::SpaceId;

/// A thread attached to a [`Heap`].
///
/// Created by [`Heap::attach_mutator`] in the runnable state. Dropping it
/// detaches the thread.
pub struct Mutator {
    heap: Arc<Heap>,
    record: Arc<MutatorRecord>,
    requests: Receiver<Request>,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, name: &str) -> Self {
        let (record, requests) = heap.threads.register(name);
        Self {
            heap,
            record,
            requests,
        }
    }

    /// The heap this mutator is attached to.
    #[must_use]
    pub const fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The name given at attach time.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Answers pending checkpoint requests and parks while the world is
    /// stopped.
    pub fn safepoint(&mut self) {
        service_requests(&self.record, &self.requests);
        if self.heap.threads.suspend_requested() {
            self.heap.threads.transition_to_suspended(&self.record);
            service_requests(&self.record, &self.requests);
            self.heap.threads.transition_to_runnable(&self.record);
        }
    }

    /// Runs `f` suspended, so collections proceed without waiting for this
    /// thread. `f` must not touch object memory.
    pub fn blocking<R>(&mut self, f: impl FnOnce(&Heap) -> R) -> R {
        self.heap.threads.transition_to_suspended(&self.record);
        service_requests(&self.record, &self.requests);
        let result = f(&self.heap);
        self.heap.threads.transition_to_runnable(&self.record);
        result
    }

    /// Allocates `bytes` of zeroed memory in `space`.
    ///
    /// A full space triggers a partial collection, then a full collection
    /// that clears soft references, before giving up.
    ///
    /// # Errors
    ///
    /// [`AllocError::NoSuchSpace`] if the heap has no such space and
    /// [`AllocError::OutOfMemory`] if it is still full after collecting.
    pub fn allocate(&mut self, space: SpaceId, bytes: usize) -> Result<ObjectRef, AllocError> {
        self.safepoint();
        if let Some(obj) = self.heap.try_allocate(Some(&*self.record), space, bytes)? {
            return Ok(obj);
        }
        for (kind, clear_soft_references) in [(GcKind::Partial, false), (GcKind::Full, true)] {
            self.collect(kind, clear_soft_references);
            if let Some(obj) = self.heap.try_allocate(Some(&*self.record), space, bytes)? {
                return Ok(obj);
            }
        }
        Err(AllocError::OutOfMemory { space, bytes })
    }

    /// Runs a collection with this thread suspended.
    pub fn collect(&mut self, kind: GcKind, clear_soft_references: bool) -> GcMetrics {
        let metrics = self.blocking(|heap| heap.collect(kind, clear_soft_references));
        self.safepoint();
        metrics
    }

    /// Verifies the heap with this thread suspended.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn verify_heap(&mut self) -> Result<(), VerifyError> {
        self.blocking(Heap::verify_heap)
    }

    /// Stores `value` into `slot` of `holder` behind the write barrier.
    #[inline]
    pub fn write_reference(&self, holder: ObjectRef, slot: Slot, value: Option<ObjectRef>) {
        self.heap.write_reference(holder, slot, value);
    }

    /// Reads the referent of the reference object held by root `reference`.
    ///
    /// While a concurrent cycle processes references this parks the thread
    /// until the referent's fate is decided. The value read while parked is
    /// only returned if no other collection started meanwhile; otherwise the
    /// reference is reread through the root, since that collection may have
    /// cleared it, freed the referent or moved either.
    pub fn get_referent(&mut self, reference: RootHandle) -> Option<ObjectRef> {
        loop {
            self.safepoint();
            let obj = self.root(reference)?;
            // Read before the slow-path flag, so a cycle that starts after
            // the flag was seen always changes it.
            let epoch = self.heap.gc_epoch.load(Ordering::Acquire);
            if !self.heap.references.slow_path_enabled() {
                return self.heap.model.referent_slot(obj).load();
            }
            let referent = self.blocking(|heap| heap.get_referent(obj));
            if self.heap.gc_epoch.load(Ordering::Acquire) == epoch {
                return referent;
            }
        }
    }

    /// Registers a root holding `value`.
    pub fn new_root(&self, value: Option<ObjectRef>) -> RootHandle {
        ordered(LockOrder::MutatorState, || self.record.roots.lock()).add(value)
    }

    /// Current value of a root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not one of this mutator's roots.
    #[must_use]
    pub fn root(&self, handle: RootHandle) -> Option<ObjectRef> {
        ordered(LockOrder::MutatorState, || self.record.roots.lock()).get(handle)
    }

    /// Overwrites a root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not one of this mutator's roots.
    pub fn set_root(&self, handle: RootHandle, value: Option<ObjectRef>) {
        ordered(LockOrder::MutatorState, || self.record.roots.lock()).set(handle, value);
    }

    /// Releases a root.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not one of this mutator's roots.
    pub fn release_root(&self, handle: RootHandle) {
        ordered(LockOrder::MutatorState, || self.record.roots.lock()).remove(handle);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.heap.threads.transition_to_suspended(&self.record);
        service_requests(&self.record, &self.requests);
        self.heap.threads.unregister(&self.record);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::config::HeapConfig;
    use crate::gc::checkpoint::ThreadState;
    use crate::object::{ObjectKind, ObjectModel, ReferenceKind};
    use crate::simple::SimpleObjectModel;

    fn parked(heap: &Heap) -> bool {
        let mut parked = false;
        heap.threads
            .for_each(|thread| parked |= thread.state() == ThreadState::Suspended);
        parked
    }

    #[test]
    fn test_get_referent_rereads_after_collection_while_parked() {
        let config = HeapConfig::default()
            .with_main_capacity(1 << 20)
            .with_bump_capacity(0)
            .with_regions(0, 64 << 10)
            .with_concurrent(false);
        let model = Arc::new(SimpleObjectModel::new());
        let heap = Heap::new(config, model.clone()).unwrap();

        let reader = {
            let heap = Arc::clone(&heap);
            let model = Arc::clone(&model);
            thread::spawn(move || {
                let mut mutator = heap.attach_mutator("reader");
                let weak = model
                    .alloc_reference(&mut mutator, SpaceId::Main, ReferenceKind::Weak, false)
                    .unwrap();
                let root = mutator.new_root(Some(weak));
                let referent = model
                    .alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Scalar, 0, 8)
                    .unwrap();
                model.set_referent(&mutator, weak, Some(referent));

                heap.references.enable_slow_path();
                let read = mutator.get_referent(root);
                (read, referent, mutator.root(root).unwrap())
            })
        };

        // The reader is parked inside `get_referent` once it is suspended
        // with the slow path on.
        while !(heap.references.slow_path_enabled() && parked(&heap)) {
            thread::yield_now();
        }
        {
            let _world = heap.threads.suspend_all(Duration::from_secs(5));
            // Wakes the reader, which then waits for the world to restart.
            heap.references.disable_slow_path();
            // Nothing but the weak reference points at the referent.
            heap.collect(GcKind::Partial, false);
        }

        let (read, referent, weak) = reader.join().unwrap();
        assert!(!heap.is_live(referent));
        assert_eq!(model.referent_slot(weak).load(), None);
        assert_eq!(read, None, "returned a referent freed while the reader was parked");
    }
}
