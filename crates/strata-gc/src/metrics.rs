//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Statistics from one collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Sequence number of the collection on its heap, starting at 1.
    pub gc_id: u64,
    /// Which collector ran.
    pub collection_type: CollectionType,
    /// Whether soft references were all cleared.
    pub clear_soft_references: bool,
    /// Wall time of the whole collection.
    pub duration: Duration,
    /// Time mutators spent suspended.
    pub pause_duration: Duration,
    /// Number of suspend-all pauses.
    pub pauses: usize,
    /// Duration of root marking and recursive marking, precleaning included.
    pub mark_duration: Duration,
    /// Duration of reference processing.
    pub reference_duration: Duration,
    /// Duration of the sweep.
    pub sweep_duration: Duration,
    /// Duration of forwarding, reference updating and moving.
    pub compact_duration: Duration,
    /// Objects newly marked by this cycle.
    pub objects_marked: usize,
    /// Cards scanned by precleaning, the remark pause and card tasks.
    pub cards_scanned: usize,
    /// Mod-union cards rescanned.
    pub mod_union_cards: usize,
    /// Times the mark stack doubled.
    pub mark_stack_resizes: usize,
    /// Preclean passes run.
    pub preclean_passes: usize,
    /// Objects reclaimed.
    pub objects_freed: usize,
    /// Bytes reclaimed.
    pub bytes_freed: usize,
    /// Objects relocated.
    pub objects_moved: usize,
    /// Bytes relocated.
    pub bytes_moved: usize,
    /// Regions returned to the free pool.
    pub regions_freed: usize,
    /// Regions whose survivors were evacuated.
    pub regions_evacuated: usize,
    /// Soft referents kept alive by policy.
    pub soft_references_preserved: usize,
    /// Soft, weak and phantom references cleared.
    pub references_cleared: usize,
    /// Finalizer references enqueued.
    pub finalizers_enqueued: usize,
    /// Heap bytes allocated when the collection started.
    pub bytes_allocated_before: usize,
    /// Heap bytes allocated when the collection ended.
    pub bytes_allocated_after: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gc_id: 0,
            collection_type: CollectionType::None,
            clear_soft_references: false,
            duration: Duration::ZERO,
            pause_duration: Duration::ZERO,
            pauses: 0,
            mark_duration: Duration::ZERO,
            reference_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            objects_marked: 0,
            cards_scanned: 0,
            mod_union_cards: 0,
            mark_stack_resizes: 0,
            preclean_passes: 0,
            objects_freed: 0,
            bytes_freed: 0,
            objects_moved: 0,
            bytes_moved: 0,
            regions_freed: 0,
            regions_evacuated: 0,
            soft_references_preserved: 0,
            references_cleared: 0,
            finalizers_enqueued: 0,
            bytes_allocated_before: 0,
            bytes_allocated_after: 0,
        }
    }

    /// Accounts one suspend-all pause that began at `start`.
    pub fn record_pause(&mut self, start: Instant) {
        self.pauses += 1;
        self.pause_duration += start.elapsed();
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Mark-sweep with concurrent marking and one remark pause.
    ConcurrentMarkSweep = 1,
    /// Mark-sweep with the world stopped.
    MarkSweep = 2,
    /// Stop-the-world mark-compact.
    MarkCompact = 3,
}

impl CollectionType {
    /// Name used in trace spans.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ConcurrentMarkSweep => "concurrent_mark_sweep",
            Self::MarkSweep => "mark_sweep",
            Self::MarkCompact => "mark_compact",
        }
    }
}

/// Internal helper for capturing phase durations.
///
/// ```
/// use strata_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
/// timer.start();
/// // ... sweeping ...
/// timer.end_sweep();
/// assert!(timer.compact.is_zero());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Accumulated mark phase time.
    pub mark: Duration,
    /// Accumulated reference processing time.
    pub reference: Duration,
    /// Accumulated sweep phase time.
    pub sweep: Duration,
    /// Accumulated compaction time.
    pub compact: Duration,
    /// Start time of current phase.
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            reference: Duration::ZERO,
            sweep: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn elapsed(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End a mark phase; marking may be timed in several pieces.
    pub fn end_mark(&mut self) {
        let elapsed = self.elapsed();
        self.mark += elapsed;
    }

    /// End reference processing.
    pub fn end_reference(&mut self) {
        let elapsed = self.elapsed();
        self.reference += elapsed;
    }

    /// End the sweep phase.
    pub fn end_sweep(&mut self) {
        let elapsed = self.elapsed();
        self.sweep += elapsed;
    }

    /// End the compaction phase.
    pub fn end_compact(&mut self) {
        let elapsed = self.elapsed();
        self.compact += elapsed;
    }

    /// Copies the accumulated durations into `metrics`.
    pub const fn apply(&self, metrics: &mut GcMetrics) {
        metrics.mark_duration = self.mark;
        metrics.reference_duration = self.reference;
        metrics.sweep_duration = self.sweep;
        metrics.compact_duration = self.compact;
    }
}

/// Cumulative statistics of one heap.
#[derive(Debug)]
pub struct HeapStats {
    collections: AtomicUsize,
    concurrent_collections: AtomicUsize,
    paused_collections: AtomicUsize,
    compactions: AtomicUsize,
    objects_allocated: AtomicUsize,
    bytes_allocated: AtomicUsize,
    objects_freed: AtomicUsize,
    bytes_freed: AtomicUsize,
    objects_moved: AtomicUsize,
    pause_ns: AtomicU64,
    gc_ns: AtomicU64,
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStats {
    /// Create a new `HeapStats` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            concurrent_collections: AtomicUsize::new(0),
            paused_collections: AtomicUsize::new(0),
            compactions: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
            objects_freed: AtomicUsize::new(0),
            bytes_freed: AtomicUsize::new(0),
            objects_moved: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            gc_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_allocation(&self, bytes: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Sequence number for the next collection.
    pub(crate) fn next_collection(&self) -> u64 {
        self.collections.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    pub(crate) fn record(&self, metrics: &GcMetrics) {
        match metrics.collection_type {
            CollectionType::ConcurrentMarkSweep => &self.concurrent_collections,
            CollectionType::MarkSweep => &self.paused_collections,
            CollectionType::MarkCompact => &self.compactions,
            CollectionType::None => return,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.objects_freed
            .fetch_add(metrics.objects_freed, Ordering::Relaxed);
        self.bytes_freed.fetch_add(metrics.bytes_freed, Ordering::Relaxed);
        self.objects_moved
            .fetch_add(metrics.objects_moved, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            u64::try_from(metrics.pause_duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.gc_ns.fetch_add(
            u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Returns the total number of collections started.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the number of concurrent mark-sweep collections.
    #[inline]
    #[must_use]
    pub fn concurrent_collections(&self) -> usize {
        self.concurrent_collections.load(Ordering::Relaxed)
    }

    /// Returns the number of stop-the-world mark-sweep collections.
    #[inline]
    #[must_use]
    pub fn paused_collections(&self) -> usize {
        self.paused_collections.load(Ordering::Relaxed)
    }

    /// Returns the number of mark-compact collections.
    #[inline]
    #[must_use]
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Returns the number of objects ever allocated.
    #[inline]
    #[must_use]
    pub fn total_objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes ever allocated.
    #[inline]
    #[must_use]
    pub fn total_bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects reclaimed.
    #[inline]
    #[must_use]
    pub fn total_objects_freed(&self) -> usize {
        self.objects_freed.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes reclaimed.
    #[inline]
    #[must_use]
    pub fn total_bytes_freed(&self) -> usize {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Returns the total number of objects relocated.
    #[inline]
    #[must_use]
    pub fn total_objects_moved(&self) -> usize {
        self.objects_moved.load(Ordering::Relaxed)
    }

    /// Returns the total pause time.
    #[inline]
    #[must_use]
    pub fn total_pause_time(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Returns the total time spent collecting.
    #[inline]
    #[must_use]
    pub fn total_gc_time(&self) -> Duration {
        Duration::from_nanos(self.gc_ns.load(Ordering::Relaxed))
    }
}
