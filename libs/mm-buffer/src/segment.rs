use std::ptr::NonNull;
use std::slice;

/// Called exactly once when an external segment is dropped, whether that
/// happens because the buffer consumed past it or because the buffer
/// itself was dropped with the segment still pending.
pub(crate) type Release = Box<dyn FnOnce(usize) + Send>;

/// A segment backed by a chunk this buffer owns outright.
pub(crate) struct InternalSegment {
    pub(crate) data: Box<[u8]>,
    pub(crate) read: usize,
    pub(crate) write: usize,
}

impl InternalSegment {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    pub(crate) fn from_vec(data: Vec<u8>) -> Self {
        let write = data.len();
        Self {
            data: data.into_boxed_slice(),
            read: 0,
            write,
        }
    }

    pub(crate) fn spare(&self) -> usize {
        self.data.len() - self.write
    }
}

/// A segment over storage the caller retains ownership of. `release` is
/// invoked with `cookie` exactly once, on drop, regardless of whether the
/// bytes were fully consumed or the buffer was torn down early.
pub(crate) struct ExternalSegment {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) consumed: usize,
    pub(crate) release: Option<Release>,
    pub(crate) cookie: usize,
}

impl Drop for ExternalSegment {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.cookie);
        }
    }
}

/// A segment that carries no stream bytes at all — a slot for out-of-band
/// data a caller threaded into the stream's insertion order. Skipped by
/// every read/skip/span/find; dropped (running `data`'s ordinary
/// destructor) the instant it reaches the head.
pub(crate) struct EmbeddedSegment {
    pub(crate) data: Box<[u8]>,
}

pub(crate) enum Segment {
    Internal(InternalSegment),
    External(ExternalSegment),
    Embedded(EmbeddedSegment),
}

impl Segment {
    /// Bytes available to read from this segment. Always zero for an
    /// embedded segment, which is how callers skip it uniformly.
    pub(crate) fn remaining(&self) -> usize {
        match self {
            Segment::Internal(s) => s.write - s.read,
            Segment::External(s) => s.len - s.consumed,
            Segment::Embedded(_) => 0,
        }
    }

    /// Borrow the next `n` unread bytes. `n` must not exceed `remaining()`.
    pub(crate) fn peek(&self, n: usize) -> &[u8] {
        match self {
            Segment::Internal(s) => &s.data[s.read..s.read + n],
            Segment::External(s) => {
                // Safety: `ptr` is valid for `len` bytes for the lifetime of
                // this segment (the caller guarantees this in `splice`),
                // and `consumed + n <= len` is the caller's invariant on
                // every `peek`/`advance` pair in this module.
                unsafe { slice::from_raw_parts(s.ptr.as_ptr().add(s.consumed), n) }
            }
            Segment::Embedded(_) => unreachable!("embedded segments carry no readable bytes"),
        }
    }

    /// Mark `n` bytes as consumed from the front of this segment.
    pub(crate) fn advance(&mut self, n: usize) {
        match self {
            Segment::Internal(s) => s.read += n,
            Segment::External(s) => s.consumed += n,
            Segment::Embedded(_) => unreachable!("embedded segments are never advanced"),
        }
    }
}
