//! Lock-free primitives shared by the dispatcher and the chunk-cache heap.
//!
//! Everything here is a leaf dependency: no module in this crate knows about
//! strands, listeners, or fibers. `mpmc_ring` is the cross-strand async
//! queue and cross-strand heap-reclamation queue; `bitset` is the small
//! fixed-width bitmap used by the block allocator's per-block free-slot map.

pub mod bitset;
pub mod mpmc_ring;

pub use bitset::Bitset64;
pub use mpmc_ring::MpmcRing;
