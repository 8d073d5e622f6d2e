//! The embedded library surface: a multi-core, cooperative-fiber runtime
//! for network services. One `Runtime` owns a shared event dispatcher and
//! one OS thread per strand; each strand runs its own fiber scheduler,
//! socket table, chunk-cache heap, and time wheel, touched only by the
//! thread that owns it (see `strand` module docs).
//!
//! Application code reaches the runtime through the free functions here,
//! not through `Strand` directly: `fiber_spawn`, `sock_register`, and the
//! `sock_*` socket operations must be called from code already running on
//! their target strand (a fiber body, a spawned reader/writer handler, or
//! the per-strand `entry` callback passed to `runtime_run`); `strand_submit`
//! and `runtime_stop` are the two operations meant to be called across
//! strand boundaries, and go through the dispatcher's async queue instead.

mod config;
mod error;
mod fiber;
mod runtime;
mod socket;
mod strand;

pub use config::{Config, ConfigBuilder};
pub use error::Error;
pub use fiber::{
    CancelFlags, Canceled, FiberAttrs, FiberCx, FiberId, Priority, SuspendReason, WakeReason,
};
pub use runtime::{runtime_create, runtime_run, runtime_stop, Runtime};
pub use socket::{HandlerFn, SinkMode, Socket, SocketFlags, SocketHandlers};
pub use strand::StrandId;

pub use mm_buffer::{Buffer, MAX_CHUNK, MIN_CHUNK};
pub use mm_time::Ticks;

use mm_event::listener::AsyncRecord;
use std::os::unix::io::RawFd;

/// Enqueues `routine` to run on `strand`'s own scheduler loop the next
/// time it drains its async queue. Returns `Err(Error::QueueFull)`
/// instead of blocking if that strand's queue is already at capacity —
/// the caller decides whether to retry or drop.
pub fn strand_submit(
    runtime: &Runtime,
    strand: StrandId,
    routine: impl FnOnce() + Send + 'static,
) -> Result<(), Error> {
    runtime
        .dispatcher()
        .post(
            strand,
            AsyncRecord {
                call: Box::new(routine),
            },
        )
        .map_err(|_| Error::QueueFull)
}

/// Spawns a fiber on the strand the calling code is itself running on.
/// `strand` is asserted against that strand's own id rather than used to
/// target a different thread — crossing strands to create a fiber goes
/// through `strand_submit` plus a `fiber_spawn` call made from inside the
/// submitted routine, which then runs on the right thread.
pub fn fiber_spawn(
    strand: StrandId,
    attrs: FiberAttrs,
    body: impl FnOnce(&FiberCx) -> Result<(), Canceled> + 'static,
) -> std::io::Result<FiberId> {
    runtime::with_current_strand(|s| {
        assert_eq!(
            s.id(),
            strand,
            "fiber_spawn's strand argument must match the calling strand"
        );
        s.spawn_fiber(attrs, body)
    })
}

/// Requests cancellation of `fiber`, which takes effect the next time it
/// reaches a cancellation point. Must be called from the same strand that
/// owns `fiber`.
pub fn fiber_cancel(fiber: FiberId) {
    runtime::with_current_strand(|s| s.cancel_fiber(fiber));
}

/// Binds `fd` into the calling strand's dispatcher listener, returning a
/// `Socket` handle. `nonblock` should match how `fd` was actually opened;
/// this runtime never sets `O_NONBLOCK` on the caller's behalf. `mode`
/// picks whether the sink stays always-armed (`SinkMode::Regular`, the
/// usual choice, including for handler-driven sockets) or starts disarmed
/// and is armed one direction at a time by a blocking `sock_read`/
/// `sock_write` call (`SinkMode::Trigger`) — see `SinkMode`'s own docs.
pub fn sock_register(
    fd: RawFd,
    nonblock: bool,
    mode: SinkMode,
    handlers: SocketHandlers,
) -> std::io::Result<Socket> {
    runtime::with_current_strand(|s| s.register_socket(fd, nonblock, mode, handlers))
}

/// Reads from `socket`, suspending the calling fiber while it isn't
/// readable. See `Socket::read` for the exact drain/EOF/error semantics.
pub fn sock_read(
    socket: &Socket,
    cx: &FiberCx,
    out: &mut [u8],
    timeout: Option<Ticks>,
) -> Result<usize, Error> {
    socket.read(cx, out, timeout)
}

/// Writes to `socket`, suspending the calling fiber while it isn't
/// writable.
pub fn sock_write(
    socket: &Socket,
    cx: &FiberCx,
    buf: &[u8],
    timeout: Option<Ticks>,
) -> Result<usize, Error> {
    socket.write(cx, buf, timeout)
}

/// Closes `socket`: every subsequent `sock_read`/`sock_write` on the same
/// sink returns `BadDescriptor` without touching the fd again. Must be
/// called from the strand that owns the socket.
pub fn sock_close(strand: StrandId, socket: &Socket) -> Result<(), Error> {
    runtime::with_current_strand(|s| {
        assert_eq!(
            s.id(),
            strand,
            "sock_close's strand argument must match the calling strand"
        );
        s.close_socket(socket.sink())
    })
}
