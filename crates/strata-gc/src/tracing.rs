//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for garbage collection operations.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Collector phases, in the order a cycle runs them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Bind immune spaces and process their cards.
        Initialize,
        /// Report thread, global and runtime roots.
        MarkRoots,
        /// Drain the gray set.
        RecursiveMark,
        /// Rescan aged cards while mutators run.
        PreClean,
        /// Final remark with the world stopped.
        Remark,
        /// Process soft, weak, finalizer and phantom references.
        ProcessReferences,
        /// Reclaim unmarked objects.
        Sweep,
        /// Forward, update and move live objects.
        Compact,
        /// Clear bitmaps for the next cycle.
        Reset,
    }

    /// Stable identifier for a GC run.
    ///
    /// Used to correlate all events within a single collection. It is a
    /// process-wide monotonically increasing counter starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Global counter for generating unique GC IDs.
    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for a GC phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the end of a GC phase.
    pub fn log_phase_end(phase: GcPhase, objects: usize, bytes: usize) {
        tracing::debug!(phase = ?phase, objects, bytes, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
