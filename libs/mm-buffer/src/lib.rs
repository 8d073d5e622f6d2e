//! A segmented FIFO byte buffer built from a chain of owned, borrowed, and
//! embedded segments, addressed as one logical byte stream.

mod buffer;
mod segment;

pub use buffer::{Buffer, MAX_CHUNK, MIN_CHUNK};

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn write_then_read_round_trips_within_one_chunk() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        buf.write(b"hello world");
        assert_eq!(buf.available(), 11);
        let mut out = [0u8; 11];
        assert_eq!(buf.read(&mut out), 11);
        assert_eq!(&out, b"hello world");
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn write_spans_multiple_chunks_and_reads_back_exactly() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        buf.write(&payload);
        assert_eq!(buf.available(), payload.len());

        let mut out = vec![0u8; payload.len()];
        let n = buf.read(&mut out);
        assert_eq!(n, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn skip_discards_without_copying_across_segments() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        buf.write(&vec![1u8; 5_000]);
        buf.write(&vec![2u8; 5_000]);
        assert_eq!(buf.skip(7_000), 7_000);
        assert_eq!(buf.available(), 3_000);
        let mut out = [0u8; 3_000];
        buf.read(&mut out);
        assert!(out.iter().all(|&b| b == 2));
    }

    #[test]
    fn span_compacts_across_segment_boundary_without_consuming() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        // Fills the first segment exactly, forcing the second write into
        // a fresh one.
        buf.write(&vec![1u8; MIN_CHUNK]);
        buf.write(&vec![2u8; MIN_CHUNK]);
        let total_before = buf.available();

        let span = buf.span(MIN_CHUNK + 10).expect("enough bytes available");
        assert_eq!(span.len(), MIN_CHUNK + 10);
        assert!(span[..MIN_CHUNK].iter().all(|&b| b == 1));
        assert!(span[MIN_CHUNK..].iter().all(|&b| b == 2));

        // span peeks; it must not have consumed anything.
        assert_eq!(buf.available(), total_before);
        assert_eq!(buf.skip(MIN_CHUNK + 10), MIN_CHUNK + 10);
        assert_eq!(buf.available(), total_before - (MIN_CHUNK + 10));
    }

    #[test]
    fn span_none_when_not_enough_bytes_available() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        buf.write(b"short");
        assert!(buf.span(100).is_none());
        // a failed span must not have mutated anything observable.
        assert_eq!(buf.available(), 5);
    }

    #[test]
    fn find_locates_byte_across_segments_and_leaves_stream_intact() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        // Fill the first segment completely so the newline lands in the
        // second, exercising find's cross-segment scan.
        buf.write(&vec![b'a'; MIN_CHUNK]);
        buf.write(b"foo\nbar");
        let offset = buf.find(b'\n').expect("newline present");
        assert_eq!(offset, MIN_CHUNK + 3);

        assert_eq!(buf.skip(offset + 1), offset + 1);

        let mut rest = vec![0u8; buf.available()];
        buf.read(&mut rest);
        assert_eq!(&rest, b"bar");
    }

    #[test]
    fn find_returns_none_without_disturbing_the_stream() {
        let mut buf = Buffer::with_chunk_size(16);
        buf.write(b"no newline here");
        assert_eq!(buf.find(b'\n'), None);
        assert_eq!(buf.available(), 15);
    }

    #[test]
    fn embedded_segment_is_skipped_and_dropped_on_reaching_head() {
        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        buf.write(b"before");
        {
            let ptr = buf.embed(8);
            // Safety: the pointer was just handed back by `embed` and
            // stays valid for the duration of this write.
            unsafe { ptr.as_ptr().write_bytes(0xAB, 8) };
        }
        buf.write(b"after");

        assert_eq!(buf.available(), b"before".len() + b"after".len());

        let mut out = vec![0u8; buf.available()];
        let n = buf.read(&mut out);
        assert_eq!(n, out.len());
        assert_eq!(&out, b"beforeafter");
    }

    #[test]
    fn external_segment_release_runs_exactly_once_on_consumption() {
        let payload = b"external data".to_vec();
        let mut storage = payload.clone();
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();

        let release_count = Arc::new(AtomicUsize::new(0));
        let release_count_cb = release_count.clone();

        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        // Safety: `storage` outlives the buffer's use of it within this test.
        unsafe {
            buf.splice(
                ptr,
                payload.len(),
                move |cookie| {
                    assert_eq!(cookie, 42);
                    release_count_cb.fetch_add(1, Ordering::SeqCst);
                },
                42,
            );
        }

        let mut out = vec![0u8; payload.len()];
        assert_eq!(buf.read(&mut out), payload.len());
        assert_eq!(out, payload);
        assert_eq!(release_count.load(Ordering::SeqCst), 1);

        drop(buf);
        assert_eq!(release_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn external_segment_release_runs_on_early_drop() {
        let payload = b"partially read".to_vec();
        let mut storage = payload.clone();
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();

        let release_count = Arc::new(AtomicUsize::new(0));
        let release_count_cb = release_count.clone();

        let mut buf = Buffer::with_chunk_size(MIN_CHUNK);
        // Safety: `storage` outlives the buffer within this test.
        unsafe {
            buf.splice(ptr, payload.len(), move |_| {
                release_count_cb.fetch_add(1, Ordering::SeqCst);
            }, 0);
        }

        let mut out = [0u8; 4];
        buf.read(&mut out);
        assert_eq!(release_count.load(Ordering::SeqCst), 0);

        drop(buf);
        assert_eq!(release_count.load(Ordering::SeqCst), 1);
    }
}
