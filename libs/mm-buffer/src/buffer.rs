use std::collections::VecDeque;
use std::ptr::NonNull;

use crate::segment::{EmbeddedSegment, ExternalSegment, InternalSegment, Segment};

/// Smallest size class a freshly allocated internal segment is rounded up
/// to.
pub const MIN_CHUNK: usize = 1024;

/// Largest size class a freshly allocated internal segment is rounded
/// down to, regardless of the buffer's configured chunk size.
pub const MAX_CHUNK: usize = 512 * 1024;

const DEFAULT_CHUNK: usize = 8 * 1024;

fn round_chunk_size(requested: usize) -> usize {
    requested
        .clamp(MIN_CHUNK, MAX_CHUNK)
        .next_power_of_two()
        .clamp(MIN_CHUNK, MAX_CHUNK)
}

/// A FIFO byte stream made of a chain of segments: owned chunks grown on
/// demand, borrowed (externally released) regions, and embedded
/// out-of-band slots. The bytes between the logical head and tail are
/// always exactly the concatenation of the non-embedded segments'
/// unread payloads, in the order they were appended.
pub struct Buffer {
    segments: VecDeque<Segment>,
    chunk_size: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK)
    }
}

impl Buffer {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            chunk_size: round_chunk_size(chunk_size),
        }
    }

    /// Total unread bytes across every non-embedded segment.
    pub fn available(&self) -> usize {
        self.segments.iter().map(Segment::remaining).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Drop any embedded segments that have reached the head, running
    /// their (ordinary, implicit) destructor, and any non-embedded
    /// segment that's been fully consumed.
    fn pop_exhausted_head(&mut self) {
        while matches!(self.segments.front(), Some(seg) if seg.remaining() == 0) {
            self.segments.pop_front();
        }
    }

    /// Append `bytes` to the tail, filling the current tail segment's
    /// spare capacity first and allocating fresh chunk-sized segments as
    /// needed.
    pub fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if let Some(Segment::Internal(tail)) = self.segments.back_mut() {
                let spare = tail.spare();
                if spare > 0 {
                    let take = spare.min(bytes.len());
                    tail.data[tail.write..tail.write + take].copy_from_slice(&bytes[..take]);
                    tail.write += take;
                    bytes = &bytes[take..];
                    continue;
                }
            }
            self.segments
                .push_back(Segment::Internal(InternalSegment::new(self.chunk_size)));
        }
    }

    /// Append a segment over storage the caller owns. `release(cookie)`
    /// runs exactly once, when the segment is dropped — whether that's
    /// because it was fully read or because the buffer itself was
    /// dropped first.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes for as long as the
    /// segment remains in this buffer (until `release` runs).
    pub unsafe fn splice(
        &mut self,
        ptr: NonNull<u8>,
        len: usize,
        release: impl FnOnce(usize) + Send + 'static,
        cookie: usize,
    ) {
        self.segments.push_back(Segment::External(ExternalSegment {
            ptr,
            len,
            consumed: 0,
            release: Some(Box::new(release)),
            cookie,
        }));
    }

    /// Append an out-of-band slot of `size` bytes and return a pointer to
    /// its storage for the caller to fill in directly. The slot carries
    /// no stream bytes: read/skip/span/find all skip over it, and it is
    /// dropped the instant it becomes the head.
    pub fn embed(&mut self, size: usize) -> NonNull<u8> {
        let mut data = vec![0u8; size].into_boxed_slice();
        // Safety: `data` is a live heap allocation; `as_mut_ptr` on a
        // non-dangling boxed slice is never null, and is dangling-but-
        // non-null for `size == 0`, which is also a valid NonNull value.
        let ptr = unsafe { NonNull::new_unchecked(data.as_mut_ptr()) };
        self.segments.push_back(Segment::Embedded(EmbeddedSegment { data }));
        ptr
    }

    /// Copy up to `out.len()` unread bytes into `out`, consuming them.
    /// Returns the number of bytes actually copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() {
            self.pop_exhausted_head();
            let Some(seg) = self.segments.front_mut() else {
                break;
            };
            let take = (out.len() - written).min(seg.remaining());
            out[written..written + take].copy_from_slice(seg.peek(take));
            seg.advance(take);
            written += take;
        }
        self.pop_exhausted_head();
        written
    }

    /// Discard up to `len` unread bytes without copying them. Returns the
    /// number of bytes actually skipped.
    pub fn skip(&mut self, len: usize) -> usize {
        let mut skipped = 0;
        while skipped < len {
            self.pop_exhausted_head();
            let Some(seg) = self.segments.front_mut() else {
                break;
            };
            let take = (len - skipped).min(seg.remaining());
            seg.advance(take);
            skipped += take;
        }
        self.pop_exhausted_head();
        skipped
    }

    /// Guarantee the next `n` unread bytes are contiguous and return a
    /// borrow of them, compacting segments at the head as needed. Returns
    /// `None` if fewer than `n` bytes are available. Does not consume —
    /// pair with `skip` once the caller is done inspecting the span.
    pub fn span(&mut self, n: usize) -> Option<&[u8]> {
        if self.available() < n {
            return None;
        }
        if n == 0 {
            return Some(&[]);
        }
        self.pop_exhausted_head();
        if let Some(seg) = self.segments.front() {
            if seg.remaining() >= n {
                return Some(seg.peek(n));
            }
        }

        let mut merged = Vec::with_capacity(n);
        while merged.len() < n {
            self.pop_exhausted_head();
            let seg = self
                .segments
                .front_mut()
                .expect("available() already confirmed enough bytes");
            let take = (n - merged.len()).min(seg.remaining());
            merged.extend_from_slice(seg.peek(take));
            seg.advance(take);
        }
        self.pop_exhausted_head();

        let chunk_len = merged.len();
        self.segments
            .push_front(Segment::Internal(InternalSegment::from_vec(merged)));
        match self.segments.front() {
            Some(Segment::Internal(s)) => Some(&s.data[s.read..s.read + chunk_len]),
            _ => unreachable!("just pushed an internal segment to the front"),
        }
    }

    /// Find the first occurrence of `byte` without consuming anything,
    /// compacting the head so the matched prefix (inclusive) is
    /// contiguous. Returns its offset from the head, or `None`.
    pub fn find(&mut self, byte: u8) -> Option<usize> {
        let mut offset = 0usize;
        for seg in &self.segments {
            let remaining = seg.remaining();
            if remaining == 0 {
                continue;
            }
            if let Some(pos) = seg.peek(remaining).iter().position(|&b| b == byte) {
                let total = offset + pos;
                self.span(total + 1);
                return Some(total);
            }
            offset += remaining;
        }
        None
    }
}
