//! The per-listener state word, wake primitive, and async-call queue.
//!
//! The state word packs the listener's poll/wait status together with the
//! dequeue stamp it last observed, the way a task's lifecycle and
//! ref-count share one atomic word in a packed-state scheduler.

use mm_sync::MpmcRing;
use mycelium_bitfield::{bitfield, FromBits};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub type StrandId = u32;

/// A deferred call posted to a specific strand, to be run on that
/// strand's own fiber scheduler once drained from its listener's queue.
pub struct AsyncRecord {
    pub call: Box<dyn FnOnce() + Send>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    /// The listener is running strand code, not polling or parked.
    Running = 0b00,
    /// The listener currently owns the dispatcher's poller lock.
    Polling = 0b01,
    /// The listener failed to acquire the poller lock and is parked on
    /// its wake primitive.
    Waiting = 0b10,
}

impl FromBits<usize> for Status {
    type Error = Infallible;

    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Running as usize => Ok(Self::Running),
            b if b == Self::Polling as usize => Ok(Self::Polling),
            _ => Ok(Self::Waiting),
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as usize
    }
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a listener's status and the dispatcher dequeue
    /// sequence it last observed.
    #[derive(PartialEq, Eq)]
    pub struct Snapshot<usize> {
        const STATUS: Status;
        /// The low bits of the async queue's dequeue sequence at the last
        /// time this listener checked it. A sender compares its own
        /// enqueue sequence against this stamp to decide whether the
        /// listener still needs waking.
        const STAMP = ..;
    }
}

/// The listener's state word plus its wake primitive.
pub struct ListenerState {
    val: AtomicUsize,
    wake_lock: Mutex<bool>,
    wake_cvar: Condvar,
}

impl Default for ListenerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerState {
    pub fn new() -> Self {
        Self {
            val: AtomicUsize::new(0),
            wake_lock: Mutex::new(false),
            wake_cvar: Condvar::new(),
        }
    }

    pub fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    fn transition<T>(&self, mut f: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = f(&mut next);
            if current.0 == next.0 {
                return res;
            }
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }

    /// Transitions to `POLLING`, stamping `dequeue_stamp`.
    pub fn begin_poll(&self, dequeue_stamp: usize) {
        let stamp = dequeue_stamp & Snapshot::STAMP.raw_mask();
        self.transition(|s| {
            s.set(Snapshot::STATUS, Status::Polling).set(Snapshot::STAMP, stamp);
        });
    }

    /// Transitions to `WAITING` (called after failing to acquire the
    /// poller lock).
    pub fn begin_wait(&self) {
        self.transition(|s| {
            s.set(Snapshot::STATUS, Status::Waiting);
        });
    }

    /// Transitions to `RUNNING` and refreshes the stamp after draining the
    /// async queue.
    pub fn end_poll(&self, dequeue_stamp: usize) {
        let stamp = dequeue_stamp & Snapshot::STAMP.raw_mask();
        self.transition(|s| {
            s.set(Snapshot::STATUS, Status::Running).set(Snapshot::STAMP, stamp);
        });
    }

    pub fn status(&self) -> Status {
        self.load(Ordering::Acquire).get(Snapshot::STATUS)
    }

    pub fn stamp(&self) -> usize {
        self.load(Ordering::Acquire).get(Snapshot::STAMP)
    }

    /// Wakes this listener if it is parked in [`ListenerState::park`].
    pub fn wake(&self) {
        let mut pending = self.wake_lock.lock().unwrap();
        *pending = true;
        self.wake_cvar.notify_one();
    }

    /// Parks the current thread until [`ListenerState::wake`] is called or
    /// `timeout` elapses. A `wake` that races ahead of the call to `park`
    /// is not lost: it sets a pending flag under the same lock.
    pub fn park(&self, timeout: Option<Duration>) {
        let pending = self.wake_lock.lock().unwrap();
        let mut pending = match timeout {
            None => self.wake_cvar.wait_while(pending, |p| !*p).unwrap(),
            Some(d) => {
                self.wake_cvar
                    .wait_timeout_while(pending, d, |p| !*p)
                    .unwrap()
                    .0
            }
        };
        *pending = false;
    }
}

/// A strand's receiving half: its state word plus the queue other strands
/// post deferred calls into.
pub struct Listener {
    pub state: ListenerState,
    pub queue: MpmcRing<AsyncRecord>,
}

impl Listener {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: ListenerState::new(),
            queue: MpmcRing::new(queue_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_status_and_stamp() {
        let state = ListenerState::new();
        assert_eq!(state.status(), Status::Running);
        state.begin_poll(42);
        assert_eq!(state.status(), Status::Polling);
        assert_eq!(state.stamp(), 42);
        state.begin_wait();
        assert_eq!(state.status(), Status::Waiting);
        state.end_poll(100);
        assert_eq!(state.status(), Status::Running);
        assert_eq!(state.stamp(), 100);
    }

    #[test]
    fn wake_before_park_is_not_lost() {
        let state = ListenerState::new();
        state.wake();
        // Should return immediately, not block, since the wake is pending.
        state.park(Some(Duration::from_millis(50)));
    }
}
