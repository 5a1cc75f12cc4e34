//! Liveness primitives: the address bitmap and the gray stack.
//!
//! - Atomic word bitmap with range walks and the sweep `live AND NOT mark` walk
//! - Growable mark stack with resize accounting

pub mod bitmap;
pub mod stack;

pub use bitmap::{HeapBitmap, SWEEP_BATCH};
pub use stack::{MarkStack, DEFAULT_MARK_STACK_CAPACITY};
