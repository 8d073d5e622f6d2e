//! Drives a real two-strand ping-pong chain across the cross-strand async
//! queue: each hop runs on the strand it was posted to and immediately
//! posts the next hop back to the strand it came from, so the chain only
//! ever advances by actually crossing strand (OS-thread) boundaries.

use mm_runtime::{runtime_create, runtime_run, runtime_stop, Config, Runtime, StrandId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Scaled down from the literal 1,000,000-post scenario: each hop here
// round-trips through a real cross-thread post (allocates a boxed closure,
// locks the dispatcher's ring, wakes the target strand's listener), so a
// million of them would dominate this suite's running time without adding
// coverage beyond what a few thousand already exercise.
const ROUNDS: usize = 4_000;

fn ping(runtime: Arc<Runtime>, counter: Arc<AtomicUsize>, to: StrandId, from: StrandId) {
    let runtime2 = runtime.clone();
    let counter2 = counter.clone();
    let _ = mm_runtime::strand_submit(&runtime, to, move || {
        let done = counter2.fetch_add(1, Ordering::SeqCst) + 1;
        if done < ROUNDS {
            ping(runtime2, counter2, from, to);
        }
    });
}

#[test]
fn two_strands_cross_post_a_long_ping_pong_chain() {
    let config = Config::builder().nlisteners(2).build();
    let runtime = Arc::new(runtime_create(config).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    let run_rt = runtime.clone();
    let handle = std::thread::spawn(move || {
        runtime_run(&run_rt, |_id| {});
    });

    ping(runtime.clone(), counter.clone(), 0, 1);

    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::SeqCst) < ROUNDS && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(
        counter.load(Ordering::SeqCst),
        ROUNDS,
        "ping-pong chain stalled before completing every hop"
    );

    runtime_stop(&runtime);
    handle.join().unwrap();
}
