//! Cancels a fiber while it is genuinely suspended inside `sock_read` on a
//! real (empty, nonblocking) pipe fd, driven by a second fiber on the same
//! strand — not a fiber blocked on `yield_now()`.

use mm_runtime::{
    fiber_cancel, fiber_spawn, runtime_create, runtime_run, runtime_stop, sock_read,
    sock_register, Config, Error, FiberAttrs, SinkMode, SocketHandlers,
};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

fn nonblocking_pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed: {}", std::io::Error::last_os_error());
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        assert_eq!(rc, 0, "fcntl(O_NONBLOCK) failed: {}", std::io::Error::last_os_error());
    }
    (fds[0], fds[1])
}

#[test]
fn canceling_a_fiber_blocked_on_a_real_socket_read_interrupts_it() {
    let (read_fd, write_fd) = nonblocking_pipe();

    let config = Config::builder().nlisteners(1).build();
    let runtime = Arc::new(runtime_create(config).unwrap());
    let result = Arc::new(Mutex::new(None));

    let entry_runtime = runtime.clone();
    let entry_result = result.clone();
    let run_rt = runtime.clone();
    let handle = std::thread::spawn(move || {
        runtime_run(&run_rt, move |id| {
            let runtime = entry_runtime.clone();
            let result = entry_result.clone();

            // Blocked with a long enough timeout that the canceler fiber
            // below always gets to run and cancel it first; the eventual
            // wake still has to come from the wheel (nothing ever writes
            // to the pipe), so this also proves cancellation wins over a
            // wake that would otherwise have reported `TimedOut`.
            let reader = fiber_spawn(id, FiberAttrs::default(), move |cx| {
                let socket =
                    sock_register(read_fd, true, SinkMode::Regular, SocketHandlers::default())
                        .unwrap();
                let mut buf = [0u8; 16];
                let outcome = sock_read(&socket, cx, &mut buf, Some(150));
                *result.lock().unwrap() = Some(outcome);
                runtime_stop(&runtime);
                Ok(())
            })
            .unwrap();

            fiber_spawn(id, FiberAttrs::default(), move |cx| {
                cx.block_for(10)?;
                fiber_cancel(reader);
                Ok(())
            })
            .unwrap();
        });
    });

    handle.join().unwrap();
    unsafe {
        libc::close(write_fd);
        libc::close(read_fd);
    }

    let outcome = result.lock().unwrap().take().expect("reader fiber never recorded a result");
    assert_eq!(outcome, Err(Error::Canceled));
}
