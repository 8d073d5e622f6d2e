//! Demultiplexes one shared kernel poll set across N listeners (one per
//! strand) so that at most one listener is ever the "poller".

use crate::backend::{Backend, Direction, ReadyEvent, SinkId};
use crate::listener::{AsyncRecord, Listener, StrandId};
use mm_sync::mpmc_ring::Full;
use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default bounded spin count before a listener that fails to acquire the
/// poller lock gives up and parks on its wake primitive.
pub const DEFAULT_LOCK_SPIN_LIMIT: u32 = 32;

pub struct Dispatcher<B: Backend> {
    backend: UnsafeCell<B>,
    poller: AtomicBool,
    listeners: Vec<Listener>,
    lock_spin_limit: u32,
}

// Safety: `backend`'s exclusive methods (register/unregister/arm/disable/
// wait) are only ever invoked by the thread that holds `poller` (see
// `try_become_poller`/`release_poller`). `Backend::notify` takes `&self`
// and is documented to be safe to call concurrently with a `wait` in
// progress, so reaching it through a shared `Dispatcher<B>` reference
// never aliases mutably.
unsafe impl<B: Backend> Sync for Dispatcher<B> {}

impl<B: Backend> Dispatcher<B> {
    pub fn new(num_strands: usize, queue_capacity: usize) -> std::io::Result<Self> {
        Ok(Self {
            backend: UnsafeCell::new(B::new()?),
            poller: AtomicBool::new(false),
            listeners: (0..num_strands).map(|_| Listener::new(queue_capacity)).collect(),
            lock_spin_limit: DEFAULT_LOCK_SPIN_LIMIT,
        })
    }

    pub fn with_lock_spin_limit(mut self, limit: u32) -> Self {
        self.lock_spin_limit = limit;
        self
    }

    pub fn listener(&self, strand: StrandId) -> &Listener {
        &self.listeners[strand as usize]
    }

    fn try_become_poller(&self) -> bool {
        self.poller
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release_poller(&self) {
        self.poller.store(false, Ordering::Release);
    }

    /// # Safety
    /// Caller must hold the poller flag (`try_become_poller` returned
    /// `true`, and `release_poller` has not yet been called).
    #[allow(clippy::mut_from_ref)]
    unsafe fn backend_mut(&self) -> &mut B {
        // Safety: upheld by caller.
        unsafe { &mut *self.backend.get() }
    }

    /// Registers a sink for a given strand's listener. Must be called by
    /// the strand that will own the sink, outside of a poll in progress.
    pub fn register_sink(
        &self,
        strand: StrandId,
        sink: SinkId,
        fd: RawFd,
        readable: bool,
        writable: bool,
    ) -> std::io::Result<()> {
        let _ = strand;
        // Safety: registration only happens from the owning strand's own
        // thread, never concurrently with that strand's own poll, and the
        // backend itself is free-threaded for registration changes made
        // by the strand that isn't currently polling (see module docs).
        unsafe { self.backend_mut() }.register_sink(sink, fd, readable, writable)
    }

    pub fn unregister_sink(&self, sink: SinkId, fd: RawFd) -> std::io::Result<()> {
        unsafe { self.backend_mut() }.unregister_sink(sink, fd)
    }

    pub fn arm(&self, sink: SinkId, fd: RawFd, direction: Direction) -> std::io::Result<()> {
        unsafe { self.backend_mut() }.arm(sink, fd, direction)
    }

    pub fn disable(&self, sink: SinkId, fd: RawFd, direction: Direction) -> std::io::Result<()> {
        unsafe { self.backend_mut() }.disable(sink, fd, direction)
    }

    /// Sender side of the post-to-strand protocol: enqueues `record` on
    /// `target`'s listener and wakes it if necessary.
    pub fn post(&self, target: StrandId, record: AsyncRecord) -> Result<(), AsyncRecord> {
        let listener = &self.listeners[target as usize];
        let enqueue_seq = match listener.queue.push(record) {
            Ok(seq) => seq,
            Err(Full(record)) => return Err(record),
        };

        match listener.state.status() {
            crate::listener::Status::Waiting if listener.state.stamp() < enqueue_seq => {
                listener.state.wake();
            }
            crate::listener::Status::Polling => {
                // Safety: `notify` takes `&self` and is documented safe to
                // race with an in-progress `wait`.
                unsafe { self.backend_mut() }.notify();
            }
            _ => {}
        }
        Ok(())
    }

    /// Runs one call to `listener_poll(timeout)` for `strand`, returning
    /// the ready events harvested if this listener became the poller (an
    /// empty vector otherwise — the caller should still drain its async
    /// queue, which this method does internally via `on_record`).
    pub fn listener_poll(
        &self,
        strand: StrandId,
        timeout: Option<Duration>,
        mut on_event: impl FnMut(ReadyEvent),
        mut on_record: impl FnMut(AsyncRecord),
    ) {
        let listener = &self.listeners[strand as usize];
        let stamp_before = listener.queue.dequeue_stamp();
        listener.state.begin_poll(stamp_before);

        let mut became_poller = false;
        for _ in 0..self.lock_spin_limit {
            if self.try_become_poller() {
                became_poller = true;
                break;
            }
            std::hint::spin_loop();
        }

        if became_poller {
            let mut events = Vec::new();
            // Safety: `became_poller` means `try_become_poller` just
            // succeeded and `release_poller` has not yet run.
            let result = unsafe { self.backend_mut() }.wait(timeout, &mut events);
            self.release_poller();
            if let Err(err) = result {
                tracing::warn!(?err, "listener poll failed");
            }
            for event in events {
                on_event(event);
            }
        } else {
            listener.state.begin_wait();
            listener.state.park(timeout);
        }

        while let Some(record) = listener.queue.pop() {
            on_record(record);
        }
        listener
            .state
            .end_poll(listener.queue.dequeue_stamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReadyEvent;
    use std::io;
    use std::sync::Mutex;

    /// A backend stub that never reports real readiness, used to exercise
    /// the dispatcher's poller/park protocol without touching the kernel.
    struct NullBackend {
        events: Mutex<Vec<ReadyEvent>>,
    }

    impl Backend for NullBackend {
        fn new() -> io::Result<Self> {
            Ok(Self { events: Mutex::new(Vec::new()) })
        }

        fn register_sink(
            &mut self,
            _sink: SinkId,
            _fd: RawFd,
            _readable: bool,
            _writable: bool,
        ) -> io::Result<()> {
            Ok(())
        }

        fn unregister_sink(&mut self, _sink: SinkId, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }

        fn arm(&mut self, _sink: SinkId, _fd: RawFd, _direction: Direction) -> io::Result<()> {
            Ok(())
        }

        fn disable(&mut self, _sink: SinkId, _fd: RawFd, _direction: Direction) -> io::Result<()> {
            Ok(())
        }

        fn notify(&self) {}

        fn wait(&mut self, _timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()> {
            out.clear();
            out.extend(self.events.lock().unwrap().drain(..));
            Ok(())
        }
    }

    #[test]
    fn post_then_poll_drains_record() {
        let dispatcher: Dispatcher<NullBackend> = Dispatcher::new(1, 16).unwrap();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        dispatcher
            .post(0, AsyncRecord { call: Box::new(move || ran2.store(true, Ordering::SeqCst)) })
            .unwrap();

        dispatcher.listener_poll(0, Some(Duration::from_millis(10)), |_| {}, |record| {
            (record.call)();
        });

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn single_listener_always_becomes_poller() {
        let dispatcher: Dispatcher<NullBackend> = Dispatcher::new(1, 16).unwrap();
        let mut saw_event = false;
        dispatcher.listener_poll(
            0,
            Some(Duration::from_millis(1)),
            |_| saw_event = true,
            |_| {},
        );
        assert!(!saw_event);
    }
}
