//! Collector machinery.
//!
//! This module holds everything a cycle needs beyond the spaces themselves:
//! - Mark bitmaps, the mark stack and the serial/parallel marker
//! - Card table and the mod-union table for immune spaces
//! - Reference queues and the reference processor
//! - Checkpoints and suspend-all over registered mutators
//! - The concurrent mark-sweep and stop-the-world mark-compact collectors
//! - Lock ordering discipline for deadlock prevention

pub mod card_table;
pub(crate) mod checkpoint;
pub mod immune;
pub mod mark;
pub(crate) mod mark_compact;
pub(crate) mod mark_sweep;
pub(crate) mod marker;
pub mod mod_union;
pub mod reference;
pub mod sync;

#[cfg(feature = "tracing")]
pub(crate) mod tracing;

pub use card_table::{CardTable, CARD_AGED, CARD_CLEAN, CARD_DIRTY, CARD_SIZE};
pub use immune::ImmuneRegion;
pub use mod_union::ModUnionTable;
pub use reference::{ReferenceCollector, ReferenceProcessor, ReferenceQueue, ReferenceStats};
