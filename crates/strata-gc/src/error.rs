//! Errors surfaced to the embedding runtime.
//!
//! Only allocation failure and heap construction are recoverable. Invariant
//! violations inside the collector (bitmap range, double free, checkpoint
//! timeout, unknown reference kind) panic, and release builds abort.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::space::SpaceId;

/// An allocation that could not be satisfied even after collecting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The space is full after a partial and a full collection.
    #[error("out of memory allocating {bytes} bytes in {space:?} space")]
    OutOfMemory {
        /// Target space.
        space: SpaceId,
        /// Requested size.
        bytes: usize,
    },
    /// The heap was built without the requested space.
    #[error("heap has no {0:?} space")]
    NoSuchSpace(SpaceId),
}

/// Failure to construct a [`Heap`](crate::Heap).
#[derive(Debug, Error)]
pub enum HeapError {
    /// The configuration is inconsistent.
    #[error("invalid heap configuration: {0}")]
    Config(#[from] ConfigError),
    /// The address range could not be reserved.
    #[error("failed to reserve heap memory: {0}")]
    Reserve(#[from] io::Error),
}

/// A heap inconsistency found by [`Heap::verify_heap`](crate::Heap::verify_heap).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A reference field points outside every space.
    #[error("{holder:#x} references {target:#x}, which is outside the heap")]
    OutsideHeap {
        /// Object holding the field.
        holder: usize,
        /// Referenced address.
        target: usize,
    },
    /// A reference field points at memory that holds no allocated object.
    #[error("{holder:#x} references {target:#x}, which is not an allocated object")]
    NotAllocated {
        /// Object holding the field.
        holder: usize,
        /// Referenced address.
        target: usize,
    },
    /// The object model rejected an object header.
    #[error("object at {0:#x} has a corrupt header")]
    CorruptHeader(usize),
}

/// Aborts the cycle on a broken heap invariant.
macro_rules! heap_corruption {
    ($($arg:tt)*) => {
        panic!("heap corruption: {}", format_args!($($arg)*))
    };
}

pub(crate) use heap_corruption;
