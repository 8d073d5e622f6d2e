//! The per-strand chunk cache: `alloc`/`free` over a set of 2 MiB spans.
//!
//! A pointer carries no per-allocation header; its size class is recovered
//! by aligning it down to its span's base address and consulting that
//! span's unit map. The unit map here is a per-span lookup table kept on
//! the Rust side (a tagged enum, as suggested for reimplementations) rather
//! than the byte-packed discriminator union of the original allocator —
//! the external contract (alignment, span reconstruction, rank recovery) is
//! unchanged; only the internal bookkeeping representation is simplified.
//! Large free chunks are kept as ordinary per-rank free lists instead of
//! threading next-pointers through the freed bytes themselves.

use crate::rank::{self, HUGE_RANK, LARGE_MAX_RANK, LARGE_MIN_RANK};
use crate::span::{self, CLIENT_UNITS, HEADER_SIZE, UNIT_SIZE};
use mm_sync::{Bitset64, MpmcRing};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

const LARGE_RANKS: usize = (LARGE_MAX_RANK - LARGE_MIN_RANK + 1) as usize;
const MIN_SLOTS_PER_BLOCK_CHUNK: usize = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::OutOfMemory => f.write_str("chunk cache out of memory"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitEntry {
    Free,
    /// Base unit of a live, block-carved chunk serving `rank`; every unit
    /// spanned by the chunk carries this tag so an interior slot pointer
    /// can be mapped back to its chunk in one lookup.
    BlockBase { base_unit: u16, rank: u8 },
}

struct BlockChunk {
    base_unit: u16,
    slot_size: usize,
    num_slots: u32,
    /// Outer map: bit `w` set means word `w` of `words` has a free slot.
    word_free: Bitset64,
    /// Inner maps: `words[w]`'s bit `b` set means slot `w * 64 + b` is free.
    words: Vec<Bitset64>,
    free_count: u32,
}

impl BlockChunk {
    fn new(base_unit: u16, slot_size: usize, num_slots: u32) -> Self {
        let num_words = num_slots.div_ceil(64) as usize;
        debug_assert!(num_words <= 64, "block chunk needs more than 64 free-map words");
        let mut words = Vec::with_capacity(num_words);
        let mut remaining = num_slots;
        for _ in 0..num_words {
            let bits = remaining.min(64);
            words.push(Bitset64::with_low_bits_set(bits));
            remaining -= bits;
        }
        Self {
            base_unit,
            slot_size,
            num_slots,
            word_free: Bitset64::with_low_bits_set(num_words as u32),
            words,
            free_count: num_slots,
        }
    }

    fn take_slot(&mut self) -> Option<u32> {
        let w = self.word_free.first_set()? as usize;
        let bit = self.words[w]
            .take_first_set()
            .expect("word_free bit implies a free slot in that word");
        if self.words[w].is_empty() {
            self.word_free.clear(w as u32);
        }
        self.free_count -= 1;
        Some(w as u32 * 64 + bit)
    }

    fn return_slot(&mut self, slot: u32) {
        let w = (slot / 64) as usize;
        let bit = slot % 64;
        debug_assert!(!self.words[w].get(bit), "double free of slot {slot}");
        self.words[w].set(bit);
        self.word_free.set(w as u32);
        self.free_count += 1;
    }

    fn is_full(&self) -> bool {
        self.free_count == 0
    }

    fn is_empty(&self) -> bool {
        self.free_count == self.num_slots
    }
}

enum SpanKind {
    /// A subdividable heap span: `units[u]` describes unit `u`'s role.
    Heap {
        units: Vec<UnitEntry>,
        blocks: HashMap<u16, BlockChunk>,
    },
    /// A dedicated huge allocation occupying the whole region.
    Huge { len: usize },
}

struct SpanMeta {
    base: NonNull<u8>,
    region_len: usize,
    kind: SpanKind,
}

/// A per-strand size-class allocator.
///
/// All methods except [`Heap::reclaim_handle`] and the consumption of that
/// handle's queue must only be called by the owning strand; this is a
/// single-threaded, `!Sync` structure by design.
pub struct Heap {
    spans: Vec<SpanMeta>,
    span_index: HashMap<usize, usize>,
    large_free: [Vec<(usize, u16)>; LARGE_RANKS],
    reclaim: Arc<MpmcRing<NonNull<u8>>>,
}

/// A `Send + Sync` handle other strands use to return memory owned by this
/// heap; the owning strand drains it once per scheduler tick.
#[derive(Clone)]
pub struct ReclaimHandle(Arc<MpmcRing<NonNull<u8>>>);

// Safety: the inner ring is itself `Send + Sync` for `NonNull<u8>` payloads;
// we only ever push raw pointers, never dereference them here.
unsafe impl Send for ReclaimHandle {}
// Safety: see above.
unsafe impl Sync for ReclaimHandle {}

impl ReclaimHandle {
    pub fn push(&self, ptr: NonNull<u8>) {
        // A full reclaim ring would be a resource leak, not a correctness
        // issue: the owning strand is the only thing that can map pointers
        // back to chunks, so a foreign strand has no fallback path. We log
        // and drop rather than spin, since the owner will eventually catch
        // up and drain.
        if self.0.push(ptr).is_err() {
            tracing::warn!("chunk cache reclaim queue full, dropping deferred free");
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            span_index: HashMap::new(),
            large_free: std::array::from_fn(|_| Vec::new()),
            reclaim: Arc::new(MpmcRing::new(1024)),
        }
    }

    pub fn reclaim_handle(&self) -> ReclaimHandle {
        ReclaimHandle(Arc::clone(&self.reclaim))
    }

    /// Drains pointers freed by other strands through our reclaim handle.
    /// Should be called once per scheduler tick.
    pub fn drain_reclaimed(&mut self) {
        while let Some(ptr) = self.reclaim.pop() {
            self.free(ptr);
        }
    }

    /// Allocates at least `n` bytes.
    pub fn alloc(&mut self, n: usize) -> Result<NonNull<u8>, Error> {
        let rank = rank::encode_size(n.max(1));
        let found = if rank >= HUGE_RANK {
            self.alloc_huge(n)
        } else if rank::is_large(rank) {
            self.alloc_large(rank)
        } else {
            self.alloc_block(rank)
        };
        found.ok_or(Error::OutOfMemory)
    }

    /// Like [`Heap::alloc`], but aborts the process on OOM.
    pub fn xalloc(&mut self, n: usize) -> NonNull<u8> {
        self.alloc(n)
            .unwrap_or_else(|_| panic!("chunk cache out of memory allocating {n} bytes"))
    }

    pub fn free(&mut self, ptr: NonNull<u8>) {
        let span_base = span::span_base_of(ptr);
        let Some(&span_idx) = self.span_index.get(&(span_base.as_ptr() as usize)) else {
            panic!("free of pointer not owned by this heap: {ptr:p}");
        };

        // Work around the borrow checker needing split access to
        // `self.spans[span_idx]` and `self.large_free`.
        let region_len = self.spans[span_idx].region_len;
        match &mut self.spans[span_idx].kind {
            SpanKind::Huge { .. } => {
                debug_assert_eq!(ptr, span_base);
                // Safety: this region was allocated by `alloc_huge` and is
                // only freed once, here.
                unsafe { span::free_region(span_base, region_len) };
                self.span_index.remove(&(span_base.as_ptr() as usize));
                self.spans.swap_remove(span_idx);
                self.reindex_after_swap_remove(span_idx);
            }
            SpanKind::Heap { units, blocks } => {
                let offset = ptr.as_ptr() as usize - span_base.as_ptr() as usize - HEADER_SIZE;
                let unit = offset / UNIT_SIZE;
                match units[unit] {
                    UnitEntry::Free => {
                        panic!("free of pointer into an untracked unit: {ptr:p}")
                    }
                    UnitEntry::BlockBase { base_unit, rank } => {
                        let block = blocks
                            .get_mut(&base_unit)
                            .expect("unit map referenced a missing block chunk");
                        let slot_offset = offset - base_unit as usize * UNIT_SIZE;
                        let slot = (slot_offset / block.slot_size) as u32;
                        block.return_slot(slot);
                        if block.is_empty() {
                            let base_units = rank::rank_size(u32::from(rank)).div_ceil(UNIT_SIZE);
                            for u in base_unit as usize..base_unit as usize + base_units {
                                units[u] = UnitEntry::Free;
                            }
                            blocks.remove(&base_unit);
                            self.large_free[(u32::from(rank) - LARGE_MIN_RANK) as usize]
                                .push((span_idx, base_unit));
                        }
                    }
                }
            }
        }
    }

    fn alloc_huge(&mut self, n: usize) -> Option<NonNull<u8>> {
        let total = n + HEADER_SIZE;
        let (base, region_len) = span::alloc_region(total)?;
        let idx = self.spans.len();
        self.spans.push(SpanMeta {
            base,
            region_len,
            kind: SpanKind::Huge { len: n },
        });
        self.span_index.insert(base.as_ptr() as usize, idx);
        // Safety: `base + HEADER_SIZE` is within the mapped region, which is
        // at least `n + HEADER_SIZE` bytes long.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE)) })
    }

    fn alloc_large(&mut self, rank: u32) -> Option<NonNull<u8>> {
        let (span_idx, base_unit) = self.take_large_chunk(rank)?;
        // Safety: `base_unit` was just removed from a free list, so no
        // other live pointer aliases it.
        Some(unsafe { self.unit_ptr(span_idx, base_unit) })
    }

    /// Removes and returns a free chunk of exactly `rank`, splitting a
    /// larger free chunk (or minting a new span) if necessary.
    fn take_large_chunk(&mut self, rank: u32) -> Option<(usize, u16)> {
        let slot = (rank - LARGE_MIN_RANK) as usize;
        if let Some(entry) = self.large_free[slot].pop() {
            self.tag_large_base(entry.0, entry.1, rank);
            return Some(entry);
        }

        // Find the smallest free chunk at a higher rank and split it.
        for r in rank + 1..=LARGE_MAX_RANK {
            let s = (r - LARGE_MIN_RANK) as usize;
            if let Some((span_idx, base_unit)) = self.large_free[s].pop() {
                return Some(self.split_chunk(span_idx, base_unit, r, rank));
            }
        }

        // Nothing free anywhere; mint a new span and carve it up.
        let span_idx = self.new_heap_span()?;
        self.populate_free_lists(span_idx, 0, CLIENT_UNITS as u16);
        let s = slot;
        if let Some(entry) = self.large_free[s].pop() {
            self.tag_large_base(entry.0, entry.1, rank);
            return Some(entry);
        }
        // Rounding may have left the exact rank unavailable from a fresh
        // span (very small ranks only); fall back to splitting the largest
        // chunk we just registered.
        for r in rank + 1..=LARGE_MAX_RANK {
            let s = (r - LARGE_MIN_RANK) as usize;
            if let Some((sp, bu)) = self.large_free[s].pop() {
                return Some(self.split_chunk(sp, bu, r, rank));
            }
        }
        None
    }

    fn tag_large_base(&mut self, span_idx: usize, base_unit: u16, rank: u32) {
        if let SpanKind::Heap { units, .. } = &mut self.spans[span_idx].kind {
            let count = rank::rank_size(rank).div_ceil(UNIT_SIZE);
            for u in base_unit as usize..base_unit as usize + count {
                units[u] = UnitEntry::BlockBase {
                    base_unit,
                    rank: rank as u8,
                };
            }
        }
    }

    /// Splits a free chunk of rank `have` at `base_unit` to satisfy a
    /// request of rank `need`, pushing the remainder back onto the
    /// appropriate free lists (greedily, by largest-fitting rank).
    fn split_chunk(
        &mut self,
        span_idx: usize,
        base_unit: u16,
        have: u32,
        need: u32,
    ) -> (usize, u16) {
        let need_units = rank::rank_size(need).div_ceil(UNIT_SIZE);
        let have_units = rank::rank_size(have).div_ceil(UNIT_SIZE);
        let mut offset = base_unit as usize + need_units;
        let mut remaining = have_units - need_units;

        while remaining > 0 {
            let mut placed = false;
            for r in (LARGE_MIN_RANK..=LARGE_MAX_RANK).rev() {
                let units_for_r = rank::rank_size(r).div_ceil(UNIT_SIZE);
                if units_for_r <= remaining {
                    self.large_free[(r - LARGE_MIN_RANK) as usize]
                        .push((span_idx, offset as u16));
                    offset += units_for_r;
                    remaining -= units_for_r;
                    placed = true;
                    break;
                }
            }
            if !placed {
                // Leftover smaller than the minimum large chunk; wasted.
                break;
            }
        }

        self.tag_large_base(span_idx, base_unit, need);
        (span_idx, base_unit)
    }

    fn alloc_block(&mut self, rank: u32) -> Option<NonNull<u8>> {
        let slot_size = rank::rank_size(rank);

        // Find a non-full block chunk already carved for this rank.
        for span in &mut self.spans {
            if let SpanKind::Heap { blocks, .. } = &mut span.kind {
                for block in blocks.values_mut() {
                    if block.slot_size == slot_size && !block.is_full() {
                        let slot = block.take_slot().expect("checked not full above");
                        let base_unit = block.base_unit;
                        let span_idx = *self
                            .span_index
                            .get(&(span.base.as_ptr() as usize))
                            .expect("span must be indexed");
                        // Safety: slot was just reserved, so this offset is
                        // exclusively ours.
                        return Some(unsafe {
                            self.slot_ptr(span_idx, base_unit, slot_size, slot)
                        });
                    }
                }
            }
        }

        // No room: carve a new block chunk out of a host large chunk.
        let host_rank = choose_host_rank(slot_size);
        let (span_idx, base_unit) = self.take_large_chunk(host_rank)?;
        let host_bytes = rank::rank_size(host_rank);
        let num_slots = (host_bytes / slot_size) as u32;
        let chunk = BlockChunk::new(base_unit, slot_size, num_slots);

        if let SpanKind::Heap { units, blocks } = &mut self.spans[span_idx].kind {
            let unit_count = host_bytes.div_ceil(UNIT_SIZE);
            for u in base_unit as usize..base_unit as usize + unit_count {
                units[u] = UnitEntry::BlockBase {
                    base_unit,
                    rank: rank as u8,
                };
            }
            blocks.insert(base_unit, chunk);
            let block = blocks.get_mut(&base_unit).expect("just inserted");
            let slot = block.take_slot().expect("fresh chunk always has room");
            // Safety: slot was just reserved.
            return Some(unsafe { self.slot_ptr(span_idx, base_unit, slot_size, slot) });
        }
        unreachable!("take_large_chunk only returns heap spans")
    }

    fn new_heap_span(&mut self) -> Option<usize> {
        let base = span::alloc_span()?;
        let idx = self.spans.len();
        self.spans.push(SpanMeta {
            base,
            region_len: span::SPAN_SIZE,
            kind: SpanKind::Heap {
                units: vec![UnitEntry::Free; CLIENT_UNITS],
                blocks: HashMap::new(),
            },
        });
        self.span_index.insert(base.as_ptr() as usize, idx);
        Some(idx)
    }

    /// Registers `[start_unit, start_unit + count)` as free chunks, greedily
    /// by largest-fitting rank.
    fn populate_free_lists(&mut self, span_idx: usize, start_unit: u16, count: u16) {
        let mut offset = start_unit as usize;
        let mut remaining = count as usize;
        while remaining > 0 {
            let mut placed = false;
            for r in (LARGE_MIN_RANK..=LARGE_MAX_RANK).rev() {
                let units_for_r = rank::rank_size(r).div_ceil(UNIT_SIZE);
                if units_for_r <= remaining {
                    self.large_free[(r - LARGE_MIN_RANK) as usize]
                        .push((span_idx, offset as u16));
                    offset += units_for_r;
                    remaining -= units_for_r;
                    placed = true;
                    break;
                }
            }
            if !placed {
                break;
            }
        }
    }

    /// # Safety
    /// The unit at `unit` within `span_idx` must not currently be aliased by
    /// another live pointer.
    unsafe fn unit_ptr(&self, span_idx: usize, unit: u16) -> NonNull<u8> {
        let base = self.spans[span_idx].base;
        let addr = base.as_ptr() as usize + HEADER_SIZE + unit as usize * UNIT_SIZE;
        // Safety: addr is within the span's mapped region by construction.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// # Safety
    /// `slot` must have just been reserved from the block chunk at
    /// `base_unit` and not aliased elsewhere.
    unsafe fn slot_ptr(
        &self,
        span_idx: usize,
        base_unit: u16,
        slot_size: usize,
        slot: u32,
    ) -> NonNull<u8> {
        let base = self.spans[span_idx].base;
        let addr = base.as_ptr() as usize
            + HEADER_SIZE
            + base_unit as usize * UNIT_SIZE
            + slot as usize * slot_size;
        // Safety: addr is within the span's mapped region by construction.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    fn reindex_after_swap_remove(&mut self, removed_idx: usize) {
        if removed_idx < self.spans.len() {
            let moved_base = self.spans[removed_idx].base.as_ptr() as usize;
            self.span_index.insert(moved_base, removed_idx);
            for entries in &mut self.large_free {
                for entry in entries.iter_mut() {
                    if entry.0 == self.spans.len() {
                        entry.0 = removed_idx;
                    }
                }
            }
        }
    }
}

fn choose_host_rank(slot_size: usize) -> u32 {
    for r in LARGE_MIN_RANK..=LARGE_MAX_RANK {
        if rank::rank_size(r) / slot_size >= MIN_SLOTS_PER_BLOCK_CHUNK {
            return r;
        }
    }
    LARGE_MAX_RANK
}

/// Recovers the rank of the chunk a live pointer belongs to. Panics if
/// `ptr` was not returned by this heap (or has already been freed).
pub fn decode_rank(heap: &Heap, ptr: NonNull<u8>) -> u32 {
    let span_base = span::span_base_of(ptr);
    let &span_idx = heap
        .span_index
        .get(&(span_base.as_ptr() as usize))
        .expect("pointer not owned by this heap");
    match &heap.spans[span_idx].kind {
        SpanKind::Huge { len } => rank::encode_size(*len).max(HUGE_RANK),
        SpanKind::Heap { units, .. } => {
            let offset = ptr.as_ptr() as usize - span_base.as_ptr() as usize - HEADER_SIZE;
            match units[offset / UNIT_SIZE] {
                UnitEntry::Free => panic!("pointer into a free unit"),
                UnitEntry::BlockBase { rank, .. } => u32::from(rank),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_span_reconstructible() {
        let mut heap = Heap::new();
        for size in [8usize, 64, 200, 1500, 64_000] {
            let p = heap.alloc(size).expect("alloc failed");
            assert_eq!(p.as_ptr() as usize % 16, 0);
            let base = span::span_base_of(p);
            assert!(heap.span_index.contains_key(&(base.as_ptr() as usize)));
            let rank = decode_rank(&heap, p);
            assert!(rank::rank_size(rank.min(rank::LARGE_MAX_RANK)) >= size || rank >= HUGE_RANK);
            heap.free(p);
        }
    }

    #[test]
    fn mixed_size_stress_round_trip() {
        let mut heap = Heap::new();
        let sizes = [8usize, 64, 200, 1500, 64_000];
        let mut ptrs = Vec::new();
        for i in 0..10_000 {
            let size = sizes[i % sizes.len()];
            ptrs.push(heap.alloc(size).expect("alloc failed"));
        }
        // Free half, LIFO order.
        for _ in 0..5_000 {
            heap.free(ptrs.pop().unwrap());
        }
        for i in 0..10_000 {
            let size = sizes[i % sizes.len()];
            ptrs.push(heap.alloc(size).expect("alloc failed"));
        }
        while let Some(p) = ptrs.pop() {
            heap.free(p);
        }
    }

    #[test]
    fn huge_allocation_round_trips() {
        let mut heap = Heap::new();
        let p = heap.alloc(4 * 1024 * 1024).expect("alloc failed");
        assert_eq!(p.as_ptr() as usize % 16, 0);
        heap.free(p);
    }

    #[test]
    fn reclaim_handle_frees_cross_strand() {
        let mut heap = Heap::new();
        let handle = heap.reclaim_handle();
        let p = heap.alloc(64).expect("alloc failed");
        handle.push(p);
        heap.drain_reclaimed();
    }
}
