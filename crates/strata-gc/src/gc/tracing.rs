//! GC-level tracing events.

/// Log a completed checkpoint.
pub fn log_checkpoint(mutators_asked: usize, roots: usize) {
    tracing::debug!(mutators_asked, roots, "checkpoint");
}

/// Log one precleaning pass.
pub fn log_preclean(pass: usize, cards_scanned: usize, objects_marked: usize) {
    tracing::debug!(pass, cards_scanned, objects_marked, "preclean");
}

/// Log the mod-union rescan of an immune space.
pub fn log_mod_union(table: &str, cards_rescanned: usize) {
    tracing::debug!(table, cards_rescanned, "mod_union_update");
}

/// Log a suspend-all pause.
pub fn log_pause(reason: &str, duration: std::time::Duration) {
    let duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    tracing::debug!(reason, duration_us, "pause");
}

/// Log a parallel marking pass.
pub fn log_parallel_mark(workers: usize, tasks: usize) {
    tracing::debug!(workers, tasks, "parallel_mark");
}

/// Log region classification at the start of compaction.
pub fn log_region_classification(evacuated: usize, unevacuated: usize, dead: usize) {
    tracing::debug!(evacuated, unevacuated, dead, "region_classification");
}

/// Log a completed compaction.
pub fn log_compaction(objects_moved: usize, bytes_moved: usize, bytes_freed: usize) {
    tracing::debug!(objects_moved, bytes_moved, bytes_freed, "compaction");
}
