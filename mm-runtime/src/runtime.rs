//! Ties a [`Config`], one shared [`Dispatcher`], and one OS thread per
//! strand together into a running instance, and hosts the thread-local
//! "current strand" lookup the embedded-library-surface free functions in
//! `lib.rs` use to reach the strand running on the calling thread.

use crate::config::Config;
use crate::strand::{SinkRegistry, Strand, StrandId};
use mm_event::{listener::AsyncRecord, DefaultBackend, Dispatcher};
use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

thread_local! {
    static CURRENT_STRAND: Cell<*mut Strand> = const { Cell::new(std::ptr::null_mut()) };
}

/// Runs `f` against the strand owning the calling thread. Set for the
/// duration of that strand's `entry` callback and its whole `run` loop
/// (see `runtime_run`), so it is valid from a fiber body, a spawned
/// reader/writer handler, or the one-time per-strand setup routine —
/// every place application code is ever allowed to call `fiber_spawn`,
/// `sock_register`, or the other strand-local surface functions.
pub(crate) fn with_current_strand<R>(f: impl FnOnce(&mut Strand) -> R) -> R {
    CURRENT_STRAND.with(|cell| {
        let ptr = cell.get();
        assert!(
            !ptr.is_null(),
            "strand-local runtime call made from a thread that isn't running a strand"
        );
        // Safety: only ever set to a live, uniquely-owned `Strand` for the
        // duration of that strand's thread body below, and cleared before
        // the thread body returns; no other thread ever holds this value.
        let strand = unsafe { &mut *ptr };
        f(strand)
    })
}

fn set_current_strand(strand: *mut Strand) {
    CURRENT_STRAND.with(|cell| cell.set(strand));
}

/// A not-yet-started instance: the shared dispatcher and sink registry
/// every strand's thread will use once `runtime_run` spins them up.
pub struct Runtime {
    config: Config,
    dispatcher: Arc<Dispatcher<DefaultBackend>>,
    sink_registry: SinkRegistry,
}

impl Runtime {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher<DefaultBackend>> {
        &self.dispatcher
    }
}

/// Allocates the dispatcher and its per-strand listeners. Strands
/// themselves aren't constructed until `runtime_run`, since each one is
/// owned outright by the OS thread that drives it.
pub fn runtime_create(config: Config) -> io::Result<Runtime> {
    let dispatcher = Dispatcher::<DefaultBackend>::new(
        config.nlisteners() as usize,
        config.listener_queue_size() as usize,
    )?
    .with_lock_spin_limit(config.lock_spin_limit());
    Ok(Runtime {
        config,
        dispatcher: Arc::new(dispatcher),
        sink_registry: Arc::new(Mutex::new(HashMap::new())),
    })
}

/// Spawns one OS thread per strand, runs `entry` once on each strand's own
/// thread before that strand's scheduling loop starts (the place
/// application code seeds initial fibers and listening sockets via
/// `fiber_spawn`/`sock_register`), and blocks the calling thread until
/// every strand has stopped.
///
/// The literal external-interface form takes no `entry` argument; nothing
/// reachable only through `runtime_stop`/`strand_submit` could otherwise
/// seed a strand's first fiber, since `fiber_spawn` and `sock_register`
/// only work from code already running on their target strand. `entry`
/// is that seed point, invoked with the strand's own id.
pub fn runtime_run<F>(runtime: &Runtime, entry: F)
where
    F: Fn(StrandId) + Send + Sync + Clone + 'static,
{
    let nlisteners = runtime.config.nlisteners();
    let mut handles = Vec::with_capacity(nlisteners as usize);
    for id in 0..nlisteners {
        let dispatcher = runtime.dispatcher.clone();
        let registry = runtime.sink_registry.clone();
        let config = runtime.config;
        let entry = entry.clone();
        let handle = std::thread::Builder::new()
            .name(format!("mm-strand-{id}"))
            .spawn(move || {
                let mut strand = Strand::new(id, dispatcher, registry, config);
                set_current_strand(&mut strand as *mut Strand);
                entry(id);
                strand.run();
                set_current_strand(std::ptr::null_mut());
            })
            .expect("failed to spawn strand thread");
        handles.push(handle);
    }
    for handle in handles {
        let _ = handle.join();
    }
}

/// Posts a stop request to every strand. Each strand notices it the next
/// time it drains its async queue and finishes its current tick — this
/// does not interrupt a fiber already running.
pub fn runtime_stop(runtime: &Runtime) {
    for id in 0..runtime.config.nlisteners() {
        let _ = runtime.dispatcher.post(
            id,
            AsyncRecord {
                call: Box::new(|| with_current_strand(|strand| strand.request_stop())),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn runtime_run_invokes_entry_once_per_strand_and_returns_once_all_stop() {
        let config = Config::builder().nlisteners(3).build();
        let runtime = runtime_create(config).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        runtime_run(&runtime, move |id| {
            seen2.lock().unwrap().push(id);
            // Stopping before the strand's first `tick()` means `run()`
            // never descends into the backend's blocking poll.
            with_current_strand(|strand| strand.request_stop());
        });
        let mut ids = seen.lock().unwrap().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "strand-local runtime call")]
    fn with_current_strand_panics_outside_a_strand_thread() {
        with_current_strand(|_| ());
    }
}
