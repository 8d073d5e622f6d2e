//! Raw 2 MiB-aligned virtual memory spans.
//!
//! A span is either a "heap" span (subdivided into 1 KiB units by
//! [`crate::heap::Heap`]) or a "huge" span (one allocation occupying the
//! whole span past its header, possibly spanning several 2 MiB units for
//! very large requests). This module only owns the mmap/munmap lifecycle
//! and the alignment trick used to recover a span's base address from any
//! pointer inside it.

use std::ptr::{self, NonNull};

pub const SPAN_SIZE: usize = 2 * 1024 * 1024;
pub const HEADER_SIZE: usize = 4096;
pub const UNIT_SIZE: usize = 1024;
pub const UNITS_TOTAL: usize = SPAN_SIZE / UNIT_SIZE;
pub const HEADER_UNITS: usize = HEADER_SIZE / UNIT_SIZE;
pub const CLIENT_UNITS: usize = UNITS_TOTAL - HEADER_UNITS;

/// Rounds `ptr` down to its owning 2 MiB span base.
#[inline]
pub fn span_base_of(ptr: NonNull<u8>) -> NonNull<u8> {
    let addr = ptr.as_ptr() as usize;
    let base = addr & !(SPAN_SIZE - 1);
    // Safety: `base` is non-zero because `addr` is a valid pointer inside a
    // span mapped by `alloc_region`, which never maps page zero.
    unsafe { NonNull::new_unchecked(base as *mut u8) }
}

/// Reserves and commits a fresh 2 MiB-aligned region at least `min_len`
/// bytes long (rounded up to a multiple of [`SPAN_SIZE`]).
///
/// Returns `None` on OOM.
pub fn alloc_region(min_len: usize) -> Option<(NonNull<u8>, usize)> {
    let len = min_len.max(SPAN_SIZE).div_ceil(SPAN_SIZE) * SPAN_SIZE;
    let overshoot_len = len + SPAN_SIZE;
    // Safety: a plain anonymous, private mapping with no fd.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            overshoot_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    let raw_addr = raw as usize;
    let aligned_addr = (raw_addr + SPAN_SIZE - 1) & !(SPAN_SIZE - 1);
    let head_trim = aligned_addr - raw_addr;
    let tail_trim = overshoot_len - head_trim - len;

    // Safety: these ranges are strictly within the mapping we just created
    // and do not overlap the `[aligned_addr, aligned_addr + len)` region we
    // intend to keep.
    unsafe {
        if head_trim > 0 {
            libc::munmap(raw, head_trim);
        }
        if tail_trim > 0 {
            libc::munmap((aligned_addr + len) as *mut libc::c_void, tail_trim);
        }
    }

    NonNull::new(aligned_addr as *mut u8).map(|p| (p, len))
}

pub fn alloc_span() -> Option<NonNull<u8>> {
    alloc_region(SPAN_SIZE).map(|(p, _)| p)
}

/// # Safety
/// `ptr, len` must be a region returned together by a matching
/// [`alloc_region`] call that has not already been unmapped.
pub unsafe fn free_region(ptr: NonNull<u8>, len: usize) {
    // Safety: caller upholds the precondition above.
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_span_is_aligned() {
        let span = alloc_span().expect("mmap failed");
        assert_eq!(span.as_ptr() as usize % SPAN_SIZE, 0);
        // Safety: freshly allocated, not freed yet.
        unsafe { free_region(span, SPAN_SIZE) };
    }

    #[test]
    fn span_base_of_reconstructs_base() {
        let span = alloc_span().expect("mmap failed");
        // Safety: offset is within the mapped span.
        let inner = unsafe { NonNull::new_unchecked(span.as_ptr().add(HEADER_SIZE + 37)) };
        assert_eq!(span_base_of(inner), span);
        // Safety: freshly allocated, not freed yet.
        unsafe { free_region(span, SPAN_SIZE) };
    }

    #[test]
    fn huge_region_rounds_up_to_span_multiple() {
        let (ptr, len) = alloc_region(SPAN_SIZE + 1).expect("mmap failed");
        assert_eq!(len, SPAN_SIZE * 2);
        assert_eq!(ptr.as_ptr() as usize % SPAN_SIZE, 0);
        // Safety: freshly allocated, not freed yet.
        unsafe { free_region(ptr, len) };
    }
}
