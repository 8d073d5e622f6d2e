//! The per-strand scheduler: one OS thread owns one `Strand`, which in
//! turn owns its fiber slab, per-priority run queues, time wheel, chunk
//! heap, and socket table. No other thread ever touches a `Strand`'s
//! private state directly — cross-strand coordination only ever crosses
//! through the dispatcher's async queue (see `Socket::mark_ready` and
//! `reconcile_sockets` below).

use crate::config::Config;
use crate::error::Error;
use crate::fiber::{
    Canceled, FiberAttrs, FiberCx, FiberId, FiberLocal, Priority, RuntimeFiber, SuspendReason,
    WakeReason, PRIORITY_LEVELS,
};
use crate::socket::{SinkMode, Socket, SocketFlags, SocketHandlers};
use mm_event::{listener::AsyncRecord, Dispatcher, DefaultBackend, Direction, ReadyEvent, SinkId};
use mm_fiber::stack::DefaultFiberStack;
use mm_fiber::FiberResult;
use mm_mem::Heap;
use mm_time::{Ticks, TimeWheel};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type StrandId = u32;

/// A process-wide record of which strand owns a sink, shared so that
/// whichever strand becomes the dispatcher's poller for a tick can route
/// a foreign sink's readiness event back to its owner without reaching
/// into that owner's private state.
pub type SinkRegistry = Arc<Mutex<HashMap<SinkId, (StrandId, Socket)>>>;

struct FiberSlot {
    fiber: RuntimeFiber,
    priority: Priority,
    /// Set when this fiber is a spawned reader/writer handler, so its
    /// exit can drive the spawn/chain discipline in `on_handler_exit`.
    handler_of: Option<(SinkId, Direction)>,
}

/// One strand's scheduler: fiber slab, run queues, time wheel, heap, and
/// socket table, driven by repeatedly calling [`Strand::tick`].
pub struct Strand {
    id: StrandId,
    dispatcher: Arc<Dispatcher<DefaultBackend>>,
    sink_registry: SinkRegistry,
    config: Config,
    /// Wall-clock origin `clock` is measured from; reset to `now` in
    /// `new`, never adjusted afterwards. `clock` itself is recomputed
    /// fresh from elapsed time on every `tick`, rather than incremented
    /// per loop iteration, so that deadlines inserted into `wheel` as
    /// `self.clock + ticks` (a millisecond count, per `Duration::
    /// from_millis` below) are reachable after a real blocking poll.
    epoch: std::time::Instant,
    clock: Ticks,

    slots: Vec<Option<FiberSlot>>,
    /// Generation counter per slot index, bumped on `retire` — kept
    /// separate from `slots` because the slot itself goes to `None` when
    /// freed, which would otherwise lose the count a stale `FiberId`
    /// needs to be rejected against.
    generations: Vec<u32>,
    free_list: Vec<u32>,
    run_queues: [VecDeque<FiberId>; PRIORITY_LEVELS],
    pending_wake: HashMap<FiberId, WakeReason>,

    wheel: TimeWheel<FiberId>,
    wheel_entries: HashMap<FiberId, mm_time::EntryId>,

    sockets: HashMap<SinkId, Socket>,
    readers_waiting: HashMap<SinkId, FiberId>,
    writers_waiting: HashMap<SinkId, FiberId>,
    next_sink: u32,

    heap: Heap,
    stopped: bool,
}

impl Strand {
    pub fn new(
        id: StrandId,
        dispatcher: Arc<Dispatcher<DefaultBackend>>,
        sink_registry: SinkRegistry,
        config: Config,
    ) -> Self {
        Self {
            id,
            dispatcher,
            sink_registry,
            config,
            epoch: std::time::Instant::now(),
            clock: 0,
            slots: Vec::new(),
            generations: Vec::new(),
            free_list: Vec::new(),
            run_queues: std::array::from_fn(|_| VecDeque::new()),
            pending_wake: HashMap::new(),
            wheel: TimeWheel::new(),
            wheel_entries: HashMap::new(),
            sockets: HashMap::new(),
            readers_waiting: HashMap::new(),
            writers_waiting: HashMap::new(),
            next_sink: 0,
            heap: Heap::new(),
            stopped: false,
        }
    }

    pub fn id(&self) -> StrandId {
        self.id
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn request_stop(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    // ---- fiber slab -------------------------------------------------

    fn alloc_slot(&mut self, slot: FiberSlot) -> FiberId {
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(slot);
            FiberId { index, generation: self.generations[index as usize] }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(slot));
            self.generations.push(0);
            FiberId { index, generation: 0 }
        }
    }

    fn slot(&self, id: FiberId) -> Option<&FiberSlot> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.slots.get(id.index as usize)?.as_ref()
    }

    fn slot_mut(&mut self, id: FiberId) -> Option<&mut FiberSlot> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.slots.get_mut(id.index as usize)?.as_mut()
    }

    fn retire(&mut self, id: FiberId) {
        if self.slot(id).is_some() {
            self.slots[id.index as usize] = None;
            self.generations[id.index as usize] = self.generations[id.index as usize].wrapping_add(1);
            self.free_list.push(id.index);
        }
    }

    fn requeue(&mut self, id: FiberId, wake: WakeReason) {
        let Some(slot) = self.slot(id) else { return };
        let priority = slot.priority;
        self.pending_wake.insert(id, wake);
        self.run_queues[priority as usize].push_back(id);
    }

    /// Creates a fiber on this strand and enqueues it to run.
    pub fn spawn_fiber(
        &mut self,
        attrs: FiberAttrs,
        body: impl FnOnce(&FiberCx) -> Result<(), Canceled> + 'static,
    ) -> std::io::Result<FiberId> {
        self.spawn_fiber_inner(attrs, body, None)
    }

    fn spawn_fiber_inner(
        &mut self,
        attrs: FiberAttrs,
        body: impl FnOnce(&FiberCx) -> Result<(), Canceled> + 'static,
        handler_of: Option<(SinkId, Direction)>,
    ) -> std::io::Result<FiberId> {
        let stack = DefaultFiberStack::new(attrs.stack_size)?;
        let fiber = RuntimeFiber::with_stack_and_local(
            stack,
            FiberLocal::default(),
            move |_first_wake, suspend, local| {
                let cx = FiberCx::new(suspend, local);
                let result = body(&cx);
                crate::fiber::finish(local, result);
            },
        );
        let id = self.alloc_slot(FiberSlot {
            fiber,
            priority: attrs.priority,
            handler_of,
        });
        self.pending_wake.insert(id, WakeReason::Ready);
        self.run_queues[attrs.priority as usize].push_back(id);
        Ok(id)
    }

    /// Marks `id` for cancellation. Takes effect the next time that
    /// fiber reaches a cancellation point — including immediately, if it
    /// is blocked on a socket or timer wait, since its next resume will
    /// run `testcancel` before anything else. A fiber blocked with
    /// `Block` (no timeout, no socket wait) has no pending wake source
    /// and is not resumed by this call; it only notices the request once
    /// something else wakes it.
    pub fn cancel_fiber(&mut self, id: FiberId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.fiber.fiber_local().request_cancel();
        }
    }

    // ---- socket table -------------------------------------------------

    /// Mints a sink id unique to this strand: the strand id in the high
    /// 32 bits, a per-strand counter in the low 32, so no cross-strand
    /// coordination is needed to avoid collisions.
    fn alloc_sink(&mut self) -> SinkId {
        let sink = (u64::from(self.id) << 32) | u64::from(self.next_sink);
        self.next_sink = self.next_sink.wrapping_add(1);
        sink
    }

    pub fn register_socket(
        &mut self,
        fd: RawFd,
        nonblock: bool,
        mode: SinkMode,
        handlers: SocketHandlers,
    ) -> std::io::Result<Socket> {
        let sink = self.alloc_sink();
        // A regular sink stays interested in both directions for its whole
        // lifetime; a trigger sink starts disarmed; the first
        // `wait_readable`/`wait_writable` against it arms the direction it
        // needs (see `handle_suspend`).
        let (readable, writable) = match mode {
            SinkMode::Regular => (true, true),
            SinkMode::Trigger => (false, false),
        };
        let socket = Socket::new(fd, sink, nonblock, mode, handlers);
        self.dispatcher
            .register_sink(self.id, sink, fd, readable, writable)?;
        self.sink_registry
            .lock()
            .unwrap()
            .insert(sink, (self.id, socket.clone()));
        self.sockets.insert(sink, socket.clone());
        Ok(socket)
    }

    pub fn close_socket(&mut self, sink: SinkId) -> Result<(), Error> {
        let Some(socket) = self.sockets.remove(&sink) else {
            return Err(Error::BadDescriptor);
        };
        socket.mark_closed();
        let fd = socket.fd();
        let _ = self.dispatcher.unregister_sink(sink, fd);
        self.sink_registry.lock().unwrap().remove(&sink);
        if let Some(id) = self.readers_waiting.remove(&sink) {
            self.requeue(id, WakeReason::Ready);
        }
        if let Some(id) = self.writers_waiting.remove(&sink) {
            self.requeue(id, WakeReason::Ready);
        }
        // Safety: `fd` was opened by the caller of `sock_register` and is
        // only closed once, here, after the backend confirms
        // unregistration.
        unsafe {
            libc::close(fd);
        }
        Ok(())
    }

    /// Re-arms `direction` at the backend for a trigger-mode sink. A
    /// no-op for regular sinks, which are always armed.
    fn rearm_if_trigger(&self, sink: SinkId, direction: Direction) {
        let Some(socket) = self.sockets.get(&sink) else { return };
        if socket.mode() == SinkMode::Trigger {
            let _ = self.dispatcher.arm(sink, socket.fd(), direction);
        }
    }

    /// Disarms `direction` at the backend for a trigger-mode sink once the
    /// readiness that fired it has been consumed by a waiting fiber —
    /// the oneshot discipline: fired once, then disarmed until the next
    /// `wait_readable`/`wait_writable` re-arms it.
    fn disable_if_trigger(&self, socket: &Socket, direction: Direction) {
        if socket.mode() == SinkMode::Trigger {
            let _ = self.dispatcher.disable(socket.sink(), socket.fd(), direction);
        }
    }

    fn spawn_handler(&mut self, socket: Socket, direction: Direction) {
        let handler = match direction {
            Direction::Input => socket.reader_handler(),
            Direction::Output => socket.writer_handler(),
        };
        let Some(handler) = handler else { return };
        let sink = socket.sink();
        let for_body = socket.clone();
        let spawned = self.spawn_fiber_inner(
            FiberAttrs::default(),
            move |cx| {
                handler(for_body, cx);
                Ok(())
            },
            Some((sink, direction)),
        );
        if spawned.is_ok() {
            let flag = match direction {
                Direction::Input => SocketFlags::READER_SPAWNED,
                Direction::Output => SocketFlags::WRITER_SPAWNED,
            };
            socket.0.lock().unwrap().flags.insert(flag);
        }
    }

    fn on_handler_exit(&mut self, sink: SinkId, direction: Direction) {
        let Some(socket) = self.sockets.get(&sink).cloned() else { return };
        let (spawned_flag, pending_flag, ready_flag) = match direction {
            Direction::Input => (
                SocketFlags::READER_SPAWNED,
                SocketFlags::READER_PENDING,
                SocketFlags::READABLE,
            ),
            Direction::Output => (
                SocketFlags::WRITER_SPAWNED,
                SocketFlags::WRITER_PENDING,
                SocketFlags::WRITABLE,
            ),
        };
        let chain = {
            let mut inner = socket.0.lock().unwrap();
            inner.flags.remove(spawned_flag);
            inner.flags.contains(pending_flag) && inner.flags.contains(ready_flag)
        };
        if chain {
            self.spawn_handler(socket, direction);
        }
    }

    /// Reconciles every dirty socket against this strand's own waiter
    /// tables: requeues any fiber blocked in `Socket::read`/`Socket::
    /// write` whose direction is now ready, errored, or closed, and
    /// spawns a reader/writer handler fiber if one is pending and not
    /// already running. Runs after each `listener_poll` drain, with full
    /// `&mut self` access the forwarded closures never had.
    fn reconcile_sockets(&mut self) {
        let candidates: Vec<Socket> = self.sockets.values().cloned().collect();
        for socket in candidates {
            if !socket.take_dirty() {
                continue;
            }
            let sink = socket.sink();
            let flags = socket.flags();
            let read_ready = flags.contains(SocketFlags::READABLE)
                || flags.contains(SocketFlags::READ_ERROR)
                || flags.contains(SocketFlags::CLOSED);
            let write_ready = flags.contains(SocketFlags::WRITABLE)
                || flags.contains(SocketFlags::WRITE_ERROR)
                || flags.contains(SocketFlags::CLOSED);

            if read_ready {
                if let Some(id) = self.readers_waiting.remove(&sink) {
                    self.requeue(id, WakeReason::Ready);
                    self.disable_if_trigger(&socket, Direction::Input);
                } else if flags.contains(SocketFlags::READABLE)
                    && flags.contains(SocketFlags::READER_PENDING)
                    && !flags.contains(SocketFlags::READER_SPAWNED)
                {
                    self.spawn_handler(socket.clone(), Direction::Input);
                }
            }
            if write_ready {
                if let Some(id) = self.writers_waiting.remove(&sink) {
                    self.requeue(id, WakeReason::Ready);
                    self.disable_if_trigger(&socket, Direction::Output);
                } else if flags.contains(SocketFlags::WRITABLE)
                    && flags.contains(SocketFlags::WRITER_PENDING)
                    && !flags.contains(SocketFlags::WRITER_SPAWNED)
                {
                    self.spawn_handler(socket.clone(), Direction::Output);
                }
            }
        }
    }

    // ---- scheduling loop -----------------------------------------------

    fn next_run_queue(&mut self) -> Option<FiberId> {
        for level in 0..PRIORITY_LEVELS {
            if let Some(id) = self.run_queues[level].pop_front() {
                return Some(id);
            }
        }
        None
    }

    fn resume_one(&mut self, id: FiberId) {
        let wake = self.pending_wake.remove(&id).unwrap_or(WakeReason::Ready);
        let Some(slot) = self.slot_mut(id) else { return };
        let result = slot.fiber.resume(wake);
        match result {
            FiberResult::Yield(reason) => self.handle_suspend(id, reason),
            FiberResult::Return(()) => {
                let handler_of = self.slot(id).and_then(|s| s.handler_of);
                self.retire(id);
                if let Some((sink, direction)) = handler_of {
                    self.on_handler_exit(sink, direction);
                }
            }
        }
    }

    fn handle_suspend(&mut self, id: FiberId, reason: SuspendReason) {
        match reason {
            SuspendReason::Yield => self.requeue(id, WakeReason::Ready),
            SuspendReason::Block => {
                // No wheel entry, no socket registration: only an
                // explicit future call to `requeue` (via socket
                // reconciliation or a targeted wake) brings this fiber
                // back onto a run queue.
            }
            SuspendReason::BlockFor(ticks) => {
                let entry = self.wheel.insert(id, self.clock + ticks);
                self.wheel_entries.insert(id, entry);
            }
            SuspendReason::WaitReadable(sink, timeout) => {
                self.readers_waiting.insert(sink, id);
                self.rearm_if_trigger(sink, Direction::Input);
                if let Some(ticks) = timeout {
                    let entry = self.wheel.insert(id, self.clock + ticks);
                    self.wheel_entries.insert(id, entry);
                }
            }
            SuspendReason::WaitWritable(sink, timeout) => {
                self.writers_waiting.insert(sink, id);
                self.rearm_if_trigger(sink, Direction::Output);
                if let Some(ticks) = timeout {
                    let entry = self.wheel.insert(id, self.clock + ticks);
                    self.wheel_entries.insert(id, entry);
                }
            }
        }
    }

    fn expire_timers(&mut self) {
        let ready = self.wheel.pop_ready(self.clock);
        for id in ready {
            self.wheel_entries.remove(&id);
            self.readers_waiting.retain(|_, waiter| *waiter != id);
            self.writers_waiting.retain(|_, waiter| *waiter != id);
            self.requeue(id, WakeReason::TimedOut);
        }
    }

    fn route_ready_event(&mut self, event: ReadyEvent) {
        let registry = self.sink_registry.lock().unwrap();
        let Some((owner, socket)) = registry.get(&event.sink).cloned() else {
            return;
        };
        drop(registry);
        // `Socket::mark_ready` only touches the shared `Arc<Mutex<_>>`,
        // which is sound from whichever strand's thread happens to be
        // the dispatcher's poller this tick. The owning strand's own
        // `reconcile_sockets` pass — not this one — is what requeues a
        // blocked fiber or spawns a handler; this thread never reaches
        // into that strand's private run queue or waiter tables.
        socket.mark_ready(event.direction, event.error);
        // Post even when `owner == self.id`, uniformly, rather than
        // special-casing same-strand delivery: the record's body is
        // empty, it exists only to wake the owner if it is parked.
        let _ = self.dispatcher.post(owner, AsyncRecord { call: Box::new(|| {}) });
    }

    /// Milliseconds elapsed since this strand's epoch, saturating rather
    /// than truncating on the (practically unreachable) `u64::MAX`-ms
    /// overflow and never performing a narrowing `as` cast.
    fn now_ticks(&self) -> Ticks {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs one scheduling step: drains at most one ready fiber if any is
    /// queued, otherwise becomes (or waits to become) the dispatcher's
    /// poller, then reconciles dirty sockets and expired timers.
    pub fn tick(&mut self) {
        self.clock = self.now_ticks();

        if let Some(id) = self.next_run_queue() {
            self.resume_one(id);
            return;
        }

        let timeout = self
            .wheel
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(self.clock))
            .map(|ticks| Duration::from_millis(ticks.min(u32::MAX as u64)));

        let dispatcher = self.dispatcher.clone();
        let mut events = Vec::new();
        let mut records = Vec::new();
        // With nothing on the wheel, `poll_spin_limit == 0` parks until
        // explicitly woken; otherwise a bounded poll timeout makes the
        // strand recheck its run queue periodically even with no timer
        // pending, rather than sleep forever on an otherwise-idle fd set.
        dispatcher.listener_poll(
            self.id,
            timeout.or_else(|| {
                (self.config.poll_spin_limit() > 0).then(|| Duration::from_millis(50))
            }),
            |event| events.push(event),
            |record| records.push(record),
        );
        for event in events {
            self.route_ready_event(event);
        }
        for record in records {
            (record.call)();
        }

        // `listener_poll` may have just blocked for real wall-clock time;
        // re-read the clock before comparing it against wheel deadlines.
        self.clock = self.now_ticks();
        self.reconcile_sockets();
        self.expire_timers();
    }

    pub fn run(&mut self) {
        while !self.stopped {
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_strand() -> Strand {
        let dispatcher = Arc::new(Dispatcher::<DefaultBackend>::new(1, 16).unwrap());
        let registry: SinkRegistry = Arc::new(Mutex::new(HashMap::new()));
        Strand::new(0, dispatcher, registry, Config::default())
    }

    #[test]
    fn spawned_fiber_runs_to_completion_on_one_resume() {
        let mut strand = new_strand();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let id = strand
            .spawn_fiber(FiberAttrs::default(), move |_cx| {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        strand.resume_one(id);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(strand.slot(id).is_none());
    }

    #[test]
    fn yielding_fiber_is_requeued_and_resumes_past_the_yield_point() {
        let mut strand = new_strand();
        let steps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let steps2 = steps.clone();
        let id = strand
            .spawn_fiber(FiberAttrs::default(), move |cx| {
                steps2.lock().unwrap().push(1);
                cx.yield_now()?;
                steps2.lock().unwrap().push(2);
                Ok(())
            })
            .unwrap();
        strand.resume_one(id);
        assert_eq!(*steps.lock().unwrap(), vec![1]);
        let next = strand.next_run_queue().unwrap();
        assert_eq!(next, id);
        strand.resume_one(next);
        assert_eq!(*steps.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn canceled_fiber_runs_its_cleanup_handler_instead_of_the_rest_of_the_body() {
        let mut strand = new_strand();
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reached_tail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cleaned2 = cleaned.clone();
        let reached_tail2 = reached_tail.clone();
        let id = strand
            .spawn_fiber(FiberAttrs::default(), move |cx| {
                cx.push_cleanup(move || cleaned2.store(true, std::sync::atomic::Ordering::SeqCst));
                cx.yield_now()?;
                reached_tail2.store(true, std::sync::atomic::Ordering::SeqCst);
                cx.pop_cleanup();
                Ok(())
            })
            .unwrap();
        strand.resume_one(id);
        strand.cancel_fiber(id);
        let next = strand.next_run_queue().unwrap();
        strand.resume_one(next);
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!reached_tail.load(std::sync::atomic::Ordering::SeqCst));
    }
}
