//! Heap construction and collector tuning.

use std::time::Duration;

use thiserror::Error;

use crate::gc::card_table::CARD_SIZE;
use crate::gc::mark::DEFAULT_MARK_STACK_CAPACITY;

/// Which white soft referents the reference processor keeps alive when a
/// cycle is not asked to clear them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoftReferencePolicy {
    /// Keep every soft referent.
    PreserveAll,
    /// Keep every other soft referent in discovery order.
    #[default]
    Alternate,
    /// Treat soft references like weak references.
    ClearAll,
}

/// Configuration for parallel marking.
///
/// Work is split into one chunk per worker; each worker keeps a thread-local
/// gray segment and spills half of it to a shared queue once it grows past
/// `segment_capacity`.
#[derive(Debug, Clone)]
pub struct ParallelMarkConfig {
    /// Maximum number of worker threads. 0 or 1 marks on the collector thread.
    pub max_workers: usize,
    /// Entries a worker keeps locally before spilling to the shared queue.
    pub segment_capacity: usize,
    /// Minimum gray objects (or cards) before a pass goes parallel.
    pub parallel_threshold: usize,
}

impl Default for ParallelMarkConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            segment_capacity: 1024,
            parallel_threshold: 512,
        }
    }
}

impl ParallelMarkConfig {
    /// Create a new configuration with the given maximum worker count.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            ..Default::default()
        }
    }

    /// Number of workers actually used, at least 1.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.max_workers.max(1)
    }

    /// Whether any pass may run in parallel.
    #[must_use]
    pub fn use_parallel(&self) -> bool {
        self.effective_workers() > 1
    }

    /// Set the maximum number of worker threads.
    pub const fn set_max_workers(&mut self, workers: usize) {
        self.max_workers = if workers < 1 { 1 } else { workers };
    }

    /// Set the per-worker segment capacity.
    pub const fn set_segment_capacity(&mut self, capacity: usize) {
        self.segment_capacity = capacity;
    }

    /// Set the minimum amount of work for a parallel pass.
    pub const fn set_parallel_threshold(&mut self, threshold: usize) {
        self.parallel_threshold = threshold;
    }
}

/// Layout and policy of a [`Heap`](crate::Heap).
///
/// Capacities are in bytes; a capacity of 0 omits that space (the main
/// free-list space is mandatory).
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Never-collected space, bound as the immune region every cycle.
    pub immune_capacity: usize,
    /// Non-moving free-list space, swept by mark-sweep.
    pub main_capacity: usize,
    /// Bump-pointer space with TLABs, compacted by mark-compact.
    pub bump_capacity: usize,
    /// Region space, reclaimed per region and evacuated by mark-compact.
    pub region_capacity: usize,
    /// Size of one region. Power of two, at least one page.
    pub region_size: usize,
    /// Size of a thread-local allocation buffer in the bump-pointer space.
    pub tlab_size: usize,
    /// Initial capacity of the serial mark stack, in entries.
    pub mark_stack_capacity: usize,
    /// Whether `GcKind::Partial` marks concurrently with mutators.
    pub concurrent: bool,
    /// Whether `GcKind::Full` compacts when a moving space exists.
    pub full_gc_compacts: bool,
    /// Card precleaning passes before the remark pause.
    pub preclean_passes: usize,
    /// Soft reference retention when a cycle does not clear them all.
    pub soft_reference_policy: SoftReferencePolicy,
    /// Regions whose live fraction is below this are evacuated by compaction.
    pub evacuate_live_ratio: f64,
    /// How long a checkpoint or suspend-all may wait for mutators.
    pub checkpoint_timeout: Duration,
    /// Parallel marking.
    pub parallel: ParallelMarkConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            immune_capacity: 0,
            main_capacity: 32 << 20,
            bump_capacity: 16 << 20,
            region_capacity: 16 << 20,
            region_size: 256 << 10,
            tlab_size: 32 << 10,
            mark_stack_capacity: DEFAULT_MARK_STACK_CAPACITY,
            concurrent: true,
            full_gc_compacts: true,
            preclean_passes: 1,
            soft_reference_policy: SoftReferencePolicy::default(),
            evacuate_live_ratio: 0.75,
            checkpoint_timeout: Duration::from_secs(10),
            parallel: ParallelMarkConfig::default(),
        }
    }
}

impl HeapConfig {
    /// Sets the immune space capacity.
    #[must_use]
    pub const fn with_immune_capacity(mut self, bytes: usize) -> Self {
        self.immune_capacity = bytes;
        self
    }

    /// Sets the main space capacity.
    #[must_use]
    pub const fn with_main_capacity(mut self, bytes: usize) -> Self {
        self.main_capacity = bytes;
        self
    }

    /// Sets the bump-pointer space capacity.
    #[must_use]
    pub const fn with_bump_capacity(mut self, bytes: usize) -> Self {
        self.bump_capacity = bytes;
        self
    }

    /// Sets the region space capacity and region size.
    #[must_use]
    pub const fn with_regions(mut self, capacity: usize, region_size: usize) -> Self {
        self.region_capacity = capacity;
        self.region_size = region_size;
        self
    }

    /// Sets the TLAB size.
    #[must_use]
    pub const fn with_tlab_size(mut self, bytes: usize) -> Self {
        self.tlab_size = bytes;
        self
    }

    /// Sets the initial mark stack capacity.
    #[must_use]
    pub const fn with_mark_stack_capacity(mut self, entries: usize) -> Self {
        self.mark_stack_capacity = entries;
        self
    }

    /// Chooses between concurrent and paused partial collections.
    #[must_use]
    pub const fn with_concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Chooses whether full collections compact.
    #[must_use]
    pub const fn with_full_gc_compacts(mut self, compacts: bool) -> Self {
        self.full_gc_compacts = compacts;
        self
    }

    /// Sets the number of precleaning passes.
    #[must_use]
    pub const fn with_preclean_passes(mut self, passes: usize) -> Self {
        self.preclean_passes = passes;
        self
    }

    /// Sets the soft reference policy.
    #[must_use]
    pub const fn with_soft_reference_policy(mut self, policy: SoftReferencePolicy) -> Self {
        self.soft_reference_policy = policy;
        self
    }

    /// Sets the evacuation threshold.
    #[must_use]
    pub const fn with_evacuate_live_ratio(mut self, ratio: f64) -> Self {
        self.evacuate_live_ratio = ratio;
        self
    }

    /// Sets the checkpoint timeout.
    #[must_use]
    pub const fn with_checkpoint_timeout(mut self, timeout: Duration) -> Self {
        self.checkpoint_timeout = timeout;
        self
    }

    /// Sets the parallel marking configuration.
    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelMarkConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Checks the layout constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = sys_alloc::page_size();
        if self.main_capacity == 0 {
            return Err(ConfigError::MissingMainSpace);
        }
        for (space, bytes) in [
            ("immune", self.immune_capacity),
            ("main", self.main_capacity),
            ("bump", self.bump_capacity),
            ("region", self.region_capacity),
        ] {
            if bytes % CARD_SIZE != 0 {
                return Err(ConfigError::UnalignedCapacity { space, bytes });
            }
        }
        if self.region_capacity > 0 {
            if !self.region_size.is_power_of_two() || self.region_size < page {
                return Err(ConfigError::InvalidRegionSize(self.region_size));
            }
            if self.region_capacity % self.region_size != 0 {
                return Err(ConfigError::UnalignedCapacity {
                    space: "region",
                    bytes: self.region_capacity,
                });
            }
        }
        if self.bump_capacity > 0 && (self.tlab_size == 0 || self.tlab_size > self.bump_capacity) {
            return Err(ConfigError::InvalidTlabSize(self.tlab_size));
        }
        if !(0.0..=1.0).contains(&self.evacuate_live_ratio) {
            return Err(ConfigError::InvalidEvacuationRatio(self.evacuate_live_ratio));
        }
        if self.checkpoint_timeout.is_zero() {
            return Err(ConfigError::ZeroCheckpointTimeout);
        }
        Ok(())
    }
}

/// A rejected [`HeapConfig`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The main space is mandatory.
    #[error("main space capacity must be non-zero")]
    MissingMainSpace,
    /// A capacity is not a multiple of the card size or region size.
    #[error("{space} space capacity {bytes} is not aligned")]
    UnalignedCapacity {
        /// Offending space.
        space: &'static str,
        /// Requested capacity.
        bytes: usize,
    },
    /// Region size must be a power of two of at least one page.
    #[error("region size {0} must be a power of two of at least one page")]
    InvalidRegionSize(usize),
    /// TLAB size must be non-zero and fit the bump-pointer space.
    #[error("TLAB size {0} does not fit the bump-pointer space")]
    InvalidTlabSize(usize),
    /// Evacuation ratio must be within `0.0..=1.0`.
    #[error("evacuation live ratio {0} must be within 0.0..=1.0")]
    InvalidEvacuationRatio(f64),
    /// A zero timeout would fail every checkpoint.
    #[error("checkpoint timeout must be non-zero")]
    ZeroCheckpointTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(HeapConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_region_capacity_must_be_multiple_of_region_size() {
        let config = HeapConfig::default().with_regions(3 * (256 << 10) + 128, 256 << 10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnalignedCapacity { space: "region", .. })
        ));
    }

    #[test]
    fn test_region_size_power_of_two() {
        let config = HeapConfig::default().with_regions(3 << 20, 3 << 18);
        assert_eq!(config.validate(), Err(ConfigError::InvalidRegionSize(3 << 18)));
    }

    #[test]
    fn test_missing_main_space() {
        let config = HeapConfig::default().with_main_capacity(0);
        assert_eq!(config.validate(), Err(ConfigError::MissingMainSpace));
    }

    #[test]
    fn test_parallel_config_fallback() {
        let mut config = ParallelMarkConfig::new(0);
        assert_eq!(config.effective_workers(), 1);
        assert!(!config.use_parallel());
        config.set_max_workers(4);
        assert!(config.use_parallel());
    }
}
