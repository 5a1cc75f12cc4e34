//! Mutator registry, checkpoints and suspend-all.
//!
//! A checkpoint asks every registered mutator for its roots without stopping
//! the world: runnable mutators receive a request in their inbox and answer
//! at their next safepoint, suspended mutators are read directly by the
//! collector. Suspend-all raises a flag that makes every mutator park at its
//! next safepoint and waits until none is runnable.
//!
//! All state transitions happen under the registry lock, so a mutator is
//! either asked or visited, never both and never neither.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::gc::sync::{ordered, LockOrder};
use crate::object::ObjectRef;
use crate::roots::RootTable;
use crate::space::Tlab;

/// Work the collector posts to a runnable mutator.
pub(crate) enum Request {
    /// Reply with the values of every root.
    ReportRoots(Sender<Vec<ObjectRef>>),
}

/// Whether a mutator may touch the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ThreadState {
    /// Running managed code; must reach a safepoint to answer the collector.
    Runnable = 0,
    /// Blocked or parked; the collector acts on its behalf.
    Suspended = 1,
}

/// The part of a mutator the collector can see.
pub(crate) struct MutatorRecord {
    pub(crate) id: u64,
    pub(crate) name: String,
    /// Only written with the registry lock held.
    state: AtomicU8,
    pub(crate) roots: Mutex<RootTable>,
    pub(crate) tlab: Mutex<Option<Tlab>>,
    inbox: Sender<Request>,
}

impl MutatorRecord {
    pub(crate) fn state(&self) -> ThreadState {
        if self.state.load(Ordering::Acquire) == ThreadState::Suspended as u8 {
            ThreadState::Suspended
        } else {
            ThreadState::Runnable
        }
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Snapshot of the non-null roots.
    pub(crate) fn report_roots(&self) -> Vec<ObjectRef> {
        ordered(LockOrder::MutatorState, || self.roots.lock())
            .iter()
            .collect()
    }
}

impl std::fmt::Debug for MutatorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct ThreadListState {
    threads: Vec<Arc<MutatorRecord>>,
    checkpoint_active: bool,
    suspend_all: bool,
}

/// Registry of the mutators attached to one heap.
pub(crate) struct ThreadList {
    sync: Mutex<ThreadListState>,
    changed: Condvar,
    suspend_requested: AtomicBool,
    next_id: AtomicU64,
}

impl ThreadList {
    pub(crate) fn new() -> Self {
        Self {
            sync: Mutex::new(ThreadListState {
                threads: Vec::new(),
                checkpoint_active: false,
                suspend_all: false,
            }),
            changed: Condvar::new(),
            suspend_requested: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a runnable mutator, waiting out any checkpoint or suspend-all.
    pub(crate) fn register(&self, name: &str) -> (Arc<MutatorRecord>, Receiver<Request>) {
        let (inbox, requests) = channel::unbounded();
        let mut state = ordered(LockOrder::ThreadList, || self.sync.lock());
        while state.checkpoint_active || state.suspend_all {
            self.changed.wait(&mut *state);
        }
        let record = Arc::new(MutatorRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            state: AtomicU8::new(ThreadState::Runnable as u8),
            roots: Mutex::new(RootTable::new()),
            tlab: Mutex::new(None),
            inbox,
        });
        state.threads.push(Arc::clone(&record));
        (record, requests)
    }

    /// Removes a suspended mutator once no checkpoint or suspend-all is in
    /// flight.
    pub(crate) fn unregister(&self, record: &MutatorRecord) {
        debug_assert_eq!(record.state(), ThreadState::Suspended);
        let mut state = ordered(LockOrder::ThreadList, || self.sync.lock());
        while state.checkpoint_active || state.suspend_all {
            self.changed.wait(&mut *state);
        }
        state.threads.retain(|t| t.id != record.id);
        self.changed.notify_all();
    }

    /// Number of registered mutators.
    pub(crate) fn len(&self) -> usize {
        ordered(LockOrder::ThreadList, || self.sync.lock()).threads.len()
    }

    /// Marks the mutator suspended. The caller then services its inbox,
    /// since requests posted before the transition still need an answer.
    pub(crate) fn transition_to_suspended(&self, record: &MutatorRecord) {
        let _state = ordered(LockOrder::ThreadList, || self.sync.lock());
        record.set_state(ThreadState::Suspended);
        self.changed.notify_all();
    }

    /// Marks the mutator runnable, waiting while a suspend-all is active.
    pub(crate) fn transition_to_runnable(&self, record: &MutatorRecord) {
        let mut state = ordered(LockOrder::ThreadList, || self.sync.lock());
        while state.suspend_all {
            self.changed.wait(&mut *state);
        }
        record.set_state(ThreadState::Runnable);
    }

    /// Whether mutators should park at their next safepoint.
    #[inline]
    pub(crate) fn suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Collects the roots of every mutator.
    ///
    /// # Panics
    ///
    /// Panics if a runnable mutator does not answer within `timeout`.
    pub(crate) fn run_checkpoint(&self, timeout: Duration) -> Vec<ObjectRef> {
        let (reply, replies) = channel::unbounded();
        let mut roots = Vec::new();
        let mut pending = 0;
        {
            let mut state = ordered(LockOrder::ThreadList, || self.sync.lock());
            state.checkpoint_active = true;
            for thread in &state.threads {
                if thread.state() == ThreadState::Runnable
                    && thread
                        .inbox
                        .send(Request::ReportRoots(reply.clone()))
                        .is_ok()
                {
                    pending += 1;
                } else {
                    roots.extend(thread.report_roots());
                }
            }
        }
        drop(reply);

        let deadline = Instant::now() + timeout;
        let asked = pending;
        while pending > 0 {
            match replies.recv_deadline(deadline) {
                Ok(batch) => {
                    roots.extend(batch);
                    pending -= 1;
                }
                Err(RecvTimeoutError::Timeout) => panic!(
                    "checkpoint timed out after {timeout:?}: {pending} of {asked} mutators did not reach a safepoint"
                ),
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("checkpoint lost: a mutator dropped a root request")
                }
            }
        }

        let mut state = ordered(LockOrder::ThreadList, || self.sync.lock());
        state.checkpoint_active = false;
        self.changed.notify_all();
        drop(state);
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_checkpoint(asked, roots.len());
        roots
    }

    /// Parks every mutator until the returned guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if some mutator stays runnable past `timeout`.
    pub(crate) fn suspend_all(&self, timeout: Duration) -> SuspendAllGuard<'_> {
        let deadline = Instant::now() + timeout;
        let mut state = ordered(LockOrder::ThreadList, || self.sync.lock());
        state.suspend_all = true;
        self.suspend_requested.store(true, Ordering::Release);
        loop {
            let runnable = state
                .threads
                .iter()
                .filter(|t| t.state() == ThreadState::Runnable)
                .count();
            if runnable == 0 {
                break;
            }
            if self.changed.wait_until(&mut *state, deadline).timed_out() {
                panic!("suspend-all timed out after {timeout:?} with {runnable} runnable mutators");
            }
        }
        SuspendAllGuard { list: self }
    }

    /// Visits every mutator. Only meaningful while the world is suspended,
    /// or for state the visitor locks itself.
    pub(crate) fn for_each(&self, mut visitor: impl FnMut(&MutatorRecord)) {
        let state = ordered(LockOrder::ThreadList, || self.sync.lock());
        for thread in &state.threads {
            visitor(thread);
        }
    }
}

impl std::fmt::Debug for ThreadList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadList")
            .field("suspend_requested", &self.suspend_requested())
            .finish_non_exhaustive()
    }
}

/// Keeps the world stopped; resumes every mutator on drop.
#[must_use = "mutators resume as soon as the guard is dropped"]
pub(crate) struct SuspendAllGuard<'a> {
    list: &'a ThreadList,
}

impl Drop for SuspendAllGuard<'_> {
    fn drop(&mut self) {
        let mut state = ordered(LockOrder::ThreadList, || self.list.sync.lock());
        state.suspend_all = false;
        self.list.suspend_requested.store(false, Ordering::Release);
        self.list.changed.notify_all();
    }
}

/// Answers every pending request in `requests`.
pub(crate) fn service_requests(record: &MutatorRecord, requests: &Receiver<Request>) {
    while let Ok(request) = requests.try_recv() {
        match request {
            Request::ReportRoots(reply) => {
                // The collector only stops listening after panicking.
                let _ = reply.send(record.report_roots());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::new(addr).unwrap()
    }

    #[test]
    fn test_checkpoint_reads_suspended_mutator_directly() {
        let list = ThreadList::new();
        let (record, _requests) = list.register("idle");
        record.roots.lock().add(Some(obj(0x100)));
        list.transition_to_suspended(&record);
        assert_eq!(list.run_checkpoint(TIMEOUT), vec![obj(0x100)]);
    }

    #[test]
    fn test_checkpoint_is_answered_at_safepoint() {
        let list = Arc::new(ThreadList::new());
        let (record, requests) = list.register("worker");
        record.roots.lock().add(Some(obj(0x200)));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let record = Arc::clone(&record);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    service_requests(&record, &requests);
                    thread::yield_now();
                }
            })
        };

        assert_eq!(list.run_checkpoint(TIMEOUT), vec![obj(0x200)]);
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_suspend_all_waits_for_runnable_mutators() {
        let list = Arc::new(ThreadList::new());
        let (record, requests) = list.register("worker");
        let stop = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(AtomicBool::new(false));

        let worker = {
            let list = Arc::clone(&list);
            let record = Arc::clone(&record);
            let stop = Arc::clone(&stop);
            let parked = Arc::clone(&parked);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    service_requests(&record, &requests);
                    if list.suspend_requested() {
                        parked.store(true, Ordering::Release);
                        list.transition_to_suspended(&record);
                        list.transition_to_runnable(&record);
                    }
                    thread::yield_now();
                }
                list.transition_to_suspended(&record);
            })
        };

        {
            let _guard = list.suspend_all(TIMEOUT);
            assert!(parked.load(Ordering::Acquire));
            assert_eq!(record.state(), ThreadState::Suspended);
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
        list.unregister(&record);
        assert_eq!(list.len(), 0);
    }

    #[test]
    #[should_panic(expected = "checkpoint timed out")]
    fn test_unresponsive_mutator_times_out() {
        let list = ThreadList::new();
        let (_record, _requests) = list.register("stuck");
        list.run_checkpoint(Duration::from_millis(20));
    }
}
