use std::fmt;

/// The error taxonomy surfaced by the embedded library surface. Recoverable
/// conditions (`WouldBlock`, `TimedOut`, `QueueFull`) are returned to the
/// caller; fatal invariant violations are not represented here at all —
/// those abort, per the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Socket closed or never registered.
    BadDescriptor,
    /// A non-blocking attempt found the socket not ready.
    WouldBlock,
    /// A per-direction timeout was exhausted.
    TimedOut,
    /// A read returned zero; the socket has transitioned to `CLOSED`.
    PeerClosed,
    /// Other I/O error on the fd, carrying the raw `errno`.
    IoError(i32),
    /// The async queue is at capacity.
    QueueFull,
    /// The allocator returned null (non-fatal API variant only).
    OutOfMemory,
    /// A cancellation request terminated the blocking call.
    Canceled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadDescriptor => write!(f, "socket closed or never registered"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::PeerClosed => write!(f, "peer closed the connection"),
            Error::IoError(errno) => write!(f, "I/O error (errno {errno})"),
            Error::QueueFull => write!(f, "async queue is at capacity"),
            Error::OutOfMemory => write!(f, "allocator is out of memory"),
            Error::Canceled => write!(f, "operation canceled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<mm_mem::Error> for Error {
    fn from(_: mm_mem::Error) -> Self {
        Error::OutOfMemory
    }
}

/// `errno` classes that fatally close the socket rather than leaving it in
/// an errored-but-open state, per the §7 propagation policy ("not EINVAL/
/// EFAULT" is the spec's literal carve-out — everything else in this
/// common set is treated as fatal here).
pub(crate) fn errno_is_fatal(errno: i32) -> bool {
    !matches!(errno, libc::EINVAL | libc::EFAULT)
}
