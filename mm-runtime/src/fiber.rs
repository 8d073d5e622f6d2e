//! Scheduler-facing fiber types layered on top of `mm_fiber`'s stack-
//! switching primitive. Everything that needs to know about priorities,
//! cancellation, or run queues lives here, per `mm_fiber`'s own module
//! doc: "the scheduler itself ... is intentionally out of scope for this
//! crate."

use bitflags::bitflags;
use mm_event::SinkId;
use mm_fiber::stack::DefaultFiberStack;
use mm_fiber::{Fiber, Suspend};
use mm_time::Ticks;
use std::cell::{Cell, RefCell};

bitflags! {
    /// Per-fiber cancellation state, checked only at explicit cancellation
    /// points (`testcancel`, and the blocking calls on [`FiberCx`]) — this
    /// runtime never forces a stack unwind.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CancelFlags: u8 {
        /// Cancellation is honored at all. A fiber that disables this is
        /// running a non-interruptible section.
        const ENABLE    = 0b001;
        /// Cancellation may take effect at the *next* cancellation point
        /// rather than only at ones the fiber reaches after a matching
        /// re-enable. Cleared back to synchronous-only is not modeled
        /// separately: every cancellation point in this runtime already
        /// checks synchronously, so `ASYNC` only documents intent.
        const ASYNC     = 0b010;
        /// A cancellation has been requested and not yet delivered.
        const REQUESTED = 0b100;
    }
}

impl Default for CancelFlags {
    fn default() -> Self {
        CancelFlags::ENABLE
    }
}

/// Returned by a cancellation point once a cancellation request has been
/// delivered. Propagated with `?`, not a panic or a forced unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

/// Scheduling priority. Lower values run first; `High` fibers are always
/// drained from their run queue before `Normal`, and `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

pub const PRIORITY_LEVELS: usize = 3;

/// Default stack size for a spawned fiber, absent an explicit override.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Per-fiber creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct FiberAttrs {
    pub priority: Priority,
    pub stack_size: usize,
}

impl Default for FiberAttrs {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Generational handle into a strand's fiber slab. Reused slots bump the
/// generation so a stale handle from a finished fiber is never mistaken
/// for a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// What a fiber yielded to ask the scheduler for, carrying everything the
/// scheduler needs to decide where to put the fiber next (a run queue, the
/// time wheel, or a socket's waiter slot) without looking at fiber-private
/// state.
#[derive(Debug, Clone, Copy)]
pub enum SuspendReason {
    /// Ready again immediately; re-enqueue at the tail of its priority
    /// level.
    Yield,
    /// Blocked with no timeout; only an explicit wake moves it back onto a
    /// run queue.
    Block,
    /// Blocked until `Ticks` elapse, whichever comes first.
    BlockFor(Ticks),
    /// Blocked until `sink` becomes readable, or `Ticks` elapse if given.
    WaitReadable(SinkId, Option<Ticks>),
    /// Blocked until `sink` becomes writable, or `Ticks` elapse if given.
    WaitWritable(SinkId, Option<Ticks>),
}

type CleanupHandler = Box<dyn FnOnce()>;

/// Fiber-local state: cancellation flags and the LIFO cleanup-handler
/// stack, both owned by the fiber itself (not the scheduler) so they
/// survive exactly as long as the fiber does.
#[derive(Default)]
pub struct FiberLocal {
    cancel: Cell<CancelFlags>,
    cleanup: RefCell<Vec<CleanupHandler>>,
}

impl FiberLocal {
    pub fn cancel_flags(&self) -> CancelFlags {
        self.cancel.get()
    }

    pub fn set_cancel_flags(&self, flags: CancelFlags) {
        self.cancel.set(flags);
    }

    /// Marks a cancellation request pending; takes effect at the fiber's
    /// next cancellation point.
    pub fn request_cancel(&self) {
        self.cancel.set(self.cancel.get() | CancelFlags::REQUESTED);
    }

    fn run_cleanup(&self) {
        loop {
            let handler = self.cleanup.borrow_mut().pop();
            match handler {
                Some(handler) => handler(),
                None => break,
            }
        }
    }
}

/// Why the scheduler resumed a suspended fiber — fed back in as the
/// fiber's `Input` so a blocking call can tell a satisfied wait apart
/// from an elapsed timeout without a second out-of-band channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The awaited condition held (or this is the fiber's first resume).
    Ready,
    /// The timeout passed to the blocking call elapsed first.
    TimedOut,
}

/// A runtime fiber: no return value beyond the scheduling handshake,
/// since application data crosses fiber boundaries through sockets and
/// buffers, not through the fiber's own channel.
pub type RuntimeFiber = Fiber<WakeReason, SuspendReason, (), FiberLocal, DefaultFiberStack>;

/// The suspend handle a running fiber body uses to yield control back to
/// the scheduler. Wraps `mm_fiber::Suspend` with the cancellation-aware,
/// spec-named operations (`testcancel`, `block`, `wait_readable`, ...)
/// instead of the bare `suspend`/yield-value pair.
pub struct FiberCx<'a> {
    suspend: &'a Suspend<WakeReason, SuspendReason>,
    local: &'a FiberLocal,
}

impl<'a> FiberCx<'a> {
    pub fn new(suspend: &'a Suspend<WakeReason, SuspendReason>, local: &'a FiberLocal) -> Self {
        Self { suspend, local }
    }

    /// A cancellation point: if a cancellation is enabled and pending,
    /// runs every registered cleanup handler (most recently pushed first)
    /// and returns `Err(Canceled)`. Otherwise a no-op.
    pub fn testcancel(&self) -> Result<(), Canceled> {
        let flags = self.local.cancel.get();
        if flags.contains(CancelFlags::ENABLE) && flags.contains(CancelFlags::REQUESTED) {
            self.local.run_cleanup();
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Registers a handler to run if this fiber is canceled before it is
    /// popped with [`FiberCx::pop_cleanup`]. LIFO: the most recently
    /// pushed handler runs first.
    pub fn push_cleanup(&self, handler: impl FnOnce() + 'static) {
        self.local.cleanup.borrow_mut().push(Box::new(handler));
    }

    /// Removes the most recently pushed cleanup handler without running
    /// it — call this once the resource it guarded has been released
    /// through the normal path.
    pub fn pop_cleanup(&self) {
        self.local.cleanup.borrow_mut().pop();
    }

    fn suspend_and_testcancel(&self, reason: SuspendReason) -> Result<WakeReason, Canceled> {
        let wake = self.suspend.suspend(reason);
        self.testcancel()?;
        Ok(wake)
    }

    pub fn yield_now(&self) -> Result<(), Canceled> {
        self.suspend_and_testcancel(SuspendReason::Yield).map(drop)
    }

    pub fn block(&self) -> Result<(), Canceled> {
        self.suspend_and_testcancel(SuspendReason::Block).map(drop)
    }

    pub fn block_for(&self, ticks: Ticks) -> Result<WakeReason, Canceled> {
        self.suspend_and_testcancel(SuspendReason::BlockFor(ticks))
    }

    pub fn wait_readable(
        &self,
        sink: SinkId,
        timeout: Option<Ticks>,
    ) -> Result<WakeReason, Canceled> {
        self.suspend_and_testcancel(SuspendReason::WaitReadable(sink, timeout))
    }

    pub fn wait_writable(
        &self,
        sink: SinkId,
        timeout: Option<Ticks>,
    ) -> Result<WakeReason, Canceled> {
        self.suspend_and_testcancel(SuspendReason::WaitWritable(sink, timeout))
    }
}

/// Runs the cleanup stack one last time after the fiber body has
/// returned, whether it finished normally or bailed out on `Canceled` —
/// a body that bails early may still hold handlers pushed before the
/// cancellation point that fired the bail (e.g. ones guarding a resource
/// acquired earlier in the same non-cancellation-point span).
pub(crate) fn finish(local: &FiberLocal, _result: Result<(), Canceled>) {
    local.run_cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testcancel_is_a_no_op_when_no_cancellation_is_pending() {
        let local = FiberLocal::default();
        assert_eq!(local.cancel_flags(), CancelFlags::default());
    }

    #[test]
    fn request_cancel_sets_the_requested_bit_without_clearing_enable() {
        let local = FiberLocal::default();
        local.request_cancel();
        let flags = local.cancel_flags();
        assert!(flags.contains(CancelFlags::ENABLE));
        assert!(flags.contains(CancelFlags::REQUESTED));
    }

    #[test]
    fn cleanup_handlers_run_in_lifo_order_on_cancellation() {
        let local = FiberLocal::default();
        let order = std::rc::Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        local.cleanup.borrow_mut().push(Box::new(move || o1.borrow_mut().push(1)));
        local.cleanup.borrow_mut().push(Box::new(move || o2.borrow_mut().push(2)));
        local.request_cancel();
        local.run_cleanup();
        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn pop_cleanup_prevents_a_released_handler_from_running() {
        let local = FiberLocal::default();
        let ran = std::rc::Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        local.cleanup.borrow_mut().push(Box::new(move || ran2.set(true)));
        local.cleanup.borrow_mut().pop();
        local.run_cleanup();
        assert!(!ran.get());
    }
}
