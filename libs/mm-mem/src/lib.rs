//! A per-strand, mimalloc-style size-class allocator.
//!
//! Every strand owns one [`heap::Heap`]. Allocations carry no header visible
//! to the caller; the owning span's metadata is recovered by masking the
//! pointer down to its 2 MiB-aligned base. Frees that originate on a
//! different strand than the one that served the allocation go through a
//! [`heap::ReclaimHandle`] instead of touching the heap directly, since
//! `Heap` itself is not `Sync`.

pub mod heap;
pub mod rank;
pub mod span;

pub use heap::{Error, Heap, ReclaimHandle};
