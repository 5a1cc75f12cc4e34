//! A heap manager and tracing collector for managed-object runtimes.
//!
//! `strata-gc` owns the memory of a runtime's objects and reclaims the ones
//! its mutator threads can no longer reach. The runtime describes its object
//! layout once through [`ObjectModel`]; everything else lives here.
//!
//! # Features
//!
//! - **Several spaces in one reservation**: a non-moving free-list space,
//!   a bump-pointer space with thread-local allocation buffers, a region
//!   space, and an optional never-collected immune space
//! - **Concurrent mark-sweep**: marking runs alongside mutators, with card
//!   precleaning and a single remark pause
//! - **Mark-compact**: slides bump-pointer survivors and evacuates sparse
//!   regions in one stop-the-world pause
//! - **Soft, weak, finalizer and phantom references** with a cleared queue
//! - **Parallel marking** over a shared segmented work queue
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use strata_gc::simple::SimpleObjectModel;
//! use strata_gc::{GcKind, Heap, HeapConfig, ObjectKind, SpaceId};
//!
//! let model = Arc::new(SimpleObjectModel::new());
//! let heap = Heap::new(HeapConfig::default(), model.clone()).unwrap();
//! let mut mutator = heap.attach_mutator("main");
//!
//! let a = model.alloc_object(&mut mutator, SpaceId::Main, ObjectKind::Container, 1, 0).unwrap();
//! let root = mutator.new_root(Some(a));
//! let b = model.alloc_object(&mut mutator, SpaceId::Bump, ObjectKind::Scalar, 0, 32).unwrap();
//! let a = mutator.root(root).unwrap();
//! model.set_field(&mutator, a, 0, Some(b));
//!
//! mutator.collect(GcKind::Full, false);
//! let a = mutator.root(root).unwrap();
//! assert!(model.get_field(a, 0).is_some());
//! ```
//!
//! # Threads
//!
//! Every thread that touches object memory attaches a [`Mutator`]. Object
//! addresses are only stable between safepoints; roots registered with
//! [`Mutator::new_root`] or [`Heap::add_global_root`] are rewritten when
//! their targets move.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod gc;
mod heap;
pub mod metrics;
mod mutator;
mod object;
mod roots;
pub mod simple;
pub mod space;
pub mod tracing;

pub use config::{ConfigError, HeapConfig, ParallelMarkConfig, SoftReferencePolicy};
pub use error::{AllocError, HeapError, VerifyError};
pub use heap::{GcKind, Heap};
pub use metrics::{CollectionType, GcMetrics, HeapStats};
pub use mutator::Mutator;
pub use object::{align_object_size, ObjectKind, ObjectModel, ObjectRef, ReferenceKind, Slot, OBJECT_ALIGNMENT};
pub use roots::{RootHandle, RootTable};
pub use space::SpaceId;
