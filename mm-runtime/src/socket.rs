//! Wraps a nonblocking fd so fiber-based reads/writes suspend and resume
//! correctly, and so a protocol can spawn its reader/writer handler at
//! most once per direction at a time.

use crate::error::{errno_is_fatal, Error};
use crate::fiber::{FiberCx, WakeReason};
use bitflags::bitflags;
use mm_event::SinkId;
use mm_time::Ticks;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SocketFlags: u16 {
        /// Backend has reported readability since the last clear.
        const READABLE       = 1 << 0;
        /// Backend has reported writability since the last clear.
        const WRITABLE       = 1 << 1;
        /// EOF or error observed on the read direction.
        const READ_ERROR     = 1 << 2;
        /// EOF or error observed on the write direction.
        const WRITE_ERROR    = 1 << 3;
        /// A reader handler fiber is currently running.
        const READER_SPAWNED = 1 << 4;
        /// A writer handler fiber is currently running.
        const WRITER_SPAWNED = 1 << 5;
        /// A reader spawn is desired the next time the socket is readable.
        const READER_PENDING = 1 << 6;
        /// A writer spawn is desired the next time the socket is writable.
        const WRITER_PENDING = 1 << 7;
        /// The socket is dead; every operation fails with `BadDescriptor`.
        const CLOSED         = 1 << 8;
        /// Never block the fiber; return `WouldBlock` instead.
        const NONBLOCK       = 1 << 9;
    }
}

/// Whether a socket's backend registration stays armed after it fires.
///
/// `Regular` sinks are always interested in both directions; readiness is
/// edge-triggered (fires once per transition) but never needs explicit
/// re-arming. `Trigger` sinks start disarmed and are armed for one
/// direction at a time by the fiber that calls `Socket::read`/
/// `Socket::write`; once that call consumes the readiness that woke it,
/// the sink goes back to disarmed until the next blocking call re-arms it.
/// Mirrors the `{INPUT,OUTPUT}_{REGULAR,TRIGGER}` sink-mode split — a
/// trigger sink is only ever driven by a blocked fiber, never by an
/// auto-spawned reader/writer handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkMode {
    Regular,
    Trigger,
}

/// A handler spawned when a socket's reader or writer direction becomes
/// ready. Takes the socket handle so it can read/write and re-arm itself.
pub type HandlerFn = Arc<dyn Fn(Socket, &FiberCx) + Send + Sync>;

/// Per-direction handlers and spawn policy, supplied to `sock_register`.
#[derive(Clone, Default)]
pub struct SocketHandlers {
    pub reader: Option<HandlerFn>,
    pub writer: Option<HandlerFn>,
}

pub(crate) struct SocketInner {
    pub(crate) fd: RawFd,
    pub(crate) sink: SinkId,
    pub(crate) mode: SinkMode,
    pub(crate) flags: SocketFlags,
    pub(crate) read_errno: Option<i32>,
    pub(crate) write_errno: Option<i32>,
    /// Set by a foreign (poller) strand forwarding a readiness event; the
    /// owning strand's own scheduler loop clears it during its dirty-
    /// socket reconciliation pass after each `listener_poll` drain. A
    /// forwarded closure only ever touches this struct through the
    /// shared mutex — it never reaches into the owning strand's private
    /// run queue or waiter table directly.
    pub(crate) dirty: bool,
    pub(crate) reader: Option<HandlerFn>,
    pub(crate) writer: Option<HandlerFn>,
}

/// A socket handle. `Arc<Mutex<_>>` rather than a strand-owned reference
/// because readiness events forwarded from a foreign poller strand must
/// be able to reach this state from a thread other than the owner's.
#[derive(Clone)]
pub struct Socket(pub(crate) Arc<Mutex<SocketInner>>);

impl Socket {
    pub(crate) fn new(
        fd: RawFd,
        sink: SinkId,
        nonblock: bool,
        mode: SinkMode,
        handlers: SocketHandlers,
    ) -> Self {
        let mut flags = SocketFlags::empty();
        if nonblock {
            flags |= SocketFlags::NONBLOCK;
        }
        if handlers.reader.is_some() {
            flags |= SocketFlags::READER_PENDING;
        }
        if handlers.writer.is_some() {
            flags |= SocketFlags::WRITER_PENDING;
        }
        Socket(Arc::new(Mutex::new(SocketInner {
            fd,
            sink,
            mode,
            flags,
            read_errno: None,
            write_errno: None,
            dirty: false,
            reader: handlers.reader,
            writer: handlers.writer,
        })))
    }

    pub fn fd(&self) -> RawFd {
        self.0.lock().unwrap().fd
    }

    pub fn sink(&self) -> SinkId {
        self.0.lock().unwrap().sink
    }

    pub fn mode(&self) -> SinkMode {
        self.0.lock().unwrap().mode
    }

    pub fn flags(&self) -> SocketFlags {
        self.0.lock().unwrap().flags
    }

    pub fn is_closed(&self) -> bool {
        self.flags().contains(SocketFlags::CLOSED)
    }

    /// Marks readiness for `direction` and the socket dirty, without
    /// assuming anything about which thread is calling — this is the one
    /// operation a cross-strand readiness-forwarding closure is allowed
    /// to perform.
    pub(crate) fn mark_ready(&self, direction: mm_event::Direction, error: bool) {
        let mut inner = self.0.lock().unwrap();
        match direction {
            mm_event::Direction::Input => {
                inner.flags.insert(SocketFlags::READABLE);
                if error {
                    inner.flags.insert(SocketFlags::READ_ERROR);
                }
            }
            mm_event::Direction::Output => {
                inner.flags.insert(SocketFlags::WRITABLE);
                if error {
                    inner.flags.insert(SocketFlags::WRITE_ERROR);
                }
            }
        }
        inner.dirty = true;
    }

    pub(crate) fn take_dirty(&self) -> bool {
        let mut inner = self.0.lock().unwrap();
        std::mem::take(&mut inner.dirty)
    }

    pub fn set_reader_pending(&self, pending: bool) {
        let mut inner = self.0.lock().unwrap();
        inner.flags.set(SocketFlags::READER_PENDING, pending);
    }

    pub fn set_writer_pending(&self, pending: bool) {
        let mut inner = self.0.lock().unwrap();
        inner.flags.set(SocketFlags::WRITER_PENDING, pending);
    }

    pub(crate) fn reader_handler(&self) -> Option<HandlerFn> {
        self.0.lock().unwrap().reader.clone()
    }

    pub(crate) fn writer_handler(&self) -> Option<HandlerFn> {
        self.0.lock().unwrap().writer.clone()
    }

    /// Marks the socket closed, independent of unregistering the fd from
    /// the backend (the strand does that separately once it owns the
    /// fd's lifetime decision — see `Strand::close_socket`).
    pub(crate) fn mark_closed(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.flags.insert(SocketFlags::CLOSED);
    }

    /// Reads up to `out.len()` bytes, suspending the calling fiber while
    /// the socket is not readable. Mirrors the read path: drain until
    /// `EAGAIN`, observe `EINTR` transparently, treat a zero-byte read as
    /// EOF.
    pub fn read(
        &self,
        cx: &FiberCx,
        out: &mut [u8],
        timeout: Option<Ticks>,
    ) -> Result<usize, Error> {
        loop {
            cx.testcancel().map_err(|_| Error::Canceled)?;

            let fd = {
                let inner = self.0.lock().unwrap();
                if inner.flags.contains(SocketFlags::CLOSED) {
                    return Err(Error::BadDescriptor);
                }
                if !inner.flags.contains(SocketFlags::READABLE) {
                    if inner.flags.contains(SocketFlags::READ_ERROR) {
                        return Err(inner
                            .read_errno
                            .map(Error::IoError)
                            .unwrap_or(Error::PeerClosed));
                    }
                    if inner.flags.contains(SocketFlags::NONBLOCK) {
                        return Err(Error::WouldBlock);
                    }
                    drop(inner);
                    let wake = cx
                        .wait_readable(self.sink(), timeout)
                        .map_err(|_| Error::Canceled)?;
                    if wake == WakeReason::TimedOut {
                        return Err(Error::TimedOut);
                    }
                    continue;
                }
                inner.fd
            };

            // Safety: `fd` belongs to this socket and was registered
            // nonblocking by the caller of `sock_register`; `out` is a
            // valid, uniquely-borrowed `&mut [u8]` for the duration of
            // this call.
            let n = unsafe { libc::read(fd, out.as_mut_ptr().cast(), out.len()) };
            if n > 0 {
                let n = n as usize;
                if n < out.len() {
                    self.0.lock().unwrap().flags.remove(SocketFlags::READABLE);
                }
                return Ok(n);
            }
            if n == 0 {
                self.0.lock().unwrap().flags.insert(SocketFlags::CLOSED);
                return Err(Error::PeerClosed);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EAGAIN => {
                    self.0.lock().unwrap().flags.remove(SocketFlags::READABLE);
                    continue;
                }
                libc::EINTR => continue,
                other => {
                    let mut inner = self.0.lock().unwrap();
                    inner.flags.insert(SocketFlags::READ_ERROR);
                    inner.read_errno = Some(other);
                    if errno_is_fatal(other) {
                        inner.flags.insert(SocketFlags::CLOSED);
                    }
                    return Err(Error::IoError(other));
                }
            }
        }
    }

    /// Symmetric with [`Socket::read`].
    pub fn write(
        &self,
        cx: &FiberCx,
        buf: &[u8],
        timeout: Option<Ticks>,
    ) -> Result<usize, Error> {
        loop {
            cx.testcancel().map_err(|_| Error::Canceled)?;

            let fd = {
                let inner = self.0.lock().unwrap();
                if inner.flags.contains(SocketFlags::CLOSED) {
                    return Err(Error::BadDescriptor);
                }
                if !inner.flags.contains(SocketFlags::WRITABLE) {
                    if inner.flags.contains(SocketFlags::WRITE_ERROR) {
                        return Err(inner
                            .write_errno
                            .map(Error::IoError)
                            .unwrap_or(Error::PeerClosed));
                    }
                    if inner.flags.contains(SocketFlags::NONBLOCK) {
                        return Err(Error::WouldBlock);
                    }
                    drop(inner);
                    let wake = cx
                        .wait_writable(self.sink(), timeout)
                        .map_err(|_| Error::Canceled)?;
                    if wake == WakeReason::TimedOut {
                        return Err(Error::TimedOut);
                    }
                    continue;
                }
                inner.fd
            };

            // Safety: `fd` belongs to this socket; `buf` is a valid
            // shared slice for the duration of this call.
            let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if n > 0 {
                let n = n as usize;
                if n < buf.len() {
                    self.0.lock().unwrap().flags.remove(SocketFlags::WRITABLE);
                }
                return Ok(n);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EAGAIN => {
                    self.0.lock().unwrap().flags.remove(SocketFlags::WRITABLE);
                    continue;
                }
                libc::EINTR => continue,
                other => {
                    let mut inner = self.0.lock().unwrap();
                    inner.flags.insert(SocketFlags::WRITE_ERROR);
                    inner.write_errno = Some(other);
                    if errno_is_fatal(other) {
                        inner.flags.insert(SocketFlags::CLOSED);
                    }
                    return Err(Error::IoError(other));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket(nonblock: bool) -> Socket {
        Socket::new(-1, 0, nonblock, SinkMode::Regular, SocketHandlers::default())
    }

    #[test]
    fn closed_socket_reports_bad_descriptor_on_flags() {
        let socket = test_socket(true);
        assert!(!socket.is_closed());
        socket.mark_closed();
        assert!(socket.is_closed());
    }

    #[test]
    fn mark_ready_sets_the_direction_flag_and_dirty_marker() {
        let socket = test_socket(false);
        assert!(!socket.take_dirty());
        socket.mark_ready(mm_event::Direction::Input, false);
        assert!(socket.flags().contains(SocketFlags::READABLE));
        assert!(socket.take_dirty());
        // Taking dirty clears it until the next mark_ready.
        assert!(!socket.take_dirty());
    }

    #[test]
    fn registering_with_a_reader_handler_sets_reader_pending() {
        let handlers = SocketHandlers {
            reader: Some(Arc::new(|_sock, _cx| {})),
            writer: None,
        };
        let socket = Socket::new(-1, 0, true, SinkMode::Regular, handlers);
        assert!(socket.flags().contains(SocketFlags::READER_PENDING));
        assert!(!socket.flags().contains(SocketFlags::WRITER_PENDING));
    }
}
