//! The kernel readiness backend: translates register/arm/disable/notify
//! into whatever the host's readiness API (epoll or kqueue) understands.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Maximum events harvested by a single [`Backend::wait`] call.
pub const MAX_EVENTS: usize = 64;

/// Identifies a registered sink across backend calls. Assigned by the
/// caller (the dispatcher), not the backend.
pub type SinkId = u64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// One readiness notification harvested from a poll.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadyEvent {
    pub sink: SinkId,
    pub direction: Direction,
    pub error: bool,
}

/// A kernel readiness backend.
///
/// Implementations must preserve oneshot discipline: once a sink armed
/// with `arm_input`/`arm_output` fires, it will not fire again for that
/// direction until explicitly re-armed.
///
/// # Safety contract
/// `notify` takes `&self` and must be safe to call concurrently with
/// another thread blocked inside `wait` on the same backend — an eventfd
/// write and an `EVFILT_USER` trigger kevent are both safe to issue while
/// the backend's fd is parked in a syscall on another thread. All other
/// methods require exclusive access and are never called concurrently
/// with `wait` by the dispatcher's poller-lock protocol.
pub trait Backend: Send + Sized {
    fn new() -> io::Result<Self>;

    /// Registers `fd` under `sink`, edge-triggered for the requested
    /// directions (level changes are NOT repeated; callers must drain
    /// until `EAGAIN`).
    fn register_sink(
        &mut self,
        sink: SinkId,
        fd: RawFd,
        readable: bool,
        writable: bool,
    ) -> io::Result<()>;

    fn unregister_sink(&mut self, sink: SinkId, fd: RawFd) -> io::Result<()>;

    /// Arms a oneshot readiness check for `direction` on `fd`.
    fn arm(&mut self, sink: SinkId, fd: RawFd, direction: Direction) -> io::Result<()>;

    /// Disables further notifications for `direction` on `fd` until
    /// re-armed.
    fn disable(&mut self, sink: SinkId, fd: RawFd, direction: Direction) -> io::Result<()>;

    /// Wakes a thread currently blocked in `wait`.
    fn notify(&self);

    /// Blocks up to `timeout` (or indefinitely if `None`) and appends
    /// ready events to `out`. `out` is cleared first.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()>;
}
