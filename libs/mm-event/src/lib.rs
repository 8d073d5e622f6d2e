//! Kernel readiness multiplexing and the dispatcher/listener protocol.
//!
//! One [`Dispatcher`] is shared by every strand in a runtime; each strand
//! owns one [`listener::Listener`] (state word, wake primitive, and
//! async-call queue) and calls [`Dispatcher::listener_poll`] to either
//! become the poller for this tick or park until woken.

pub mod backend;
pub mod dispatcher;
pub mod listener;

pub use backend::{Backend, Direction, ReadyEvent, SinkId};
pub use dispatcher::Dispatcher;
pub use listener::{AsyncRecord, Listener, ListenerState, StrandId};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollBackend as DefaultBackend;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))] {
        mod kqueue;
        pub use kqueue::KqueueBackend as DefaultBackend;
    } else {
        compile_error!("mm-event requires a Linux epoll or BSD/macOS kqueue target");
    }
}
