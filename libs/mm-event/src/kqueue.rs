//! BSD/macOS backend: one `kqueue` fd per dispatcher, an `EVFILT_USER`
//! kevent for notify.

use crate::backend::{Backend, Direction, ReadyEvent, SinkId, MAX_EVENTS};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const NOTIFY_IDENT: usize = 0;

pub struct KqueueBackend {
    kq: RawFd,
    fd_to_sink: HashMap<RawFd, SinkId>,
    raw: Vec<libc::kevent>,
}

impl KqueueBackend {
    fn change(ident: usize, filter: i16, flags: u16, fflags: u32, udata: SinkId) -> libc::kevent {
        libc::kevent {
            ident,
            filter,
            flags,
            fflags,
            data: 0,
            udata: udata as usize as _,
        }
    }

    fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        // Safety: `changes` outlives the call, no output buffer is requested.
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn new() -> io::Result<Self> {
        // Safety: plain syscall, error checked below.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: fcntl on our own freshly created fd.
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        let backend = Self {
            kq,
            fd_to_sink: HashMap::new(),
            // Safety: a zeroed kevent is a valid bit pattern.
            raw: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
        };
        backend.submit(&[Self::change(
            NOTIFY_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
            0,
        )])?;
        Ok(backend)
    }

    fn register_sink(
        &mut self,
        sink: SinkId,
        fd: RawFd,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if readable {
            changes.push(Self::change(
                fd as usize,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_CLEAR,
                0,
                sink,
            ));
        }
        if writable {
            changes.push(Self::change(
                fd as usize,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_CLEAR,
                0,
                sink,
            ));
        }
        self.submit(&changes)?;
        self.fd_to_sink.insert(fd, sink);
        Ok(())
    }

    fn unregister_sink(&mut self, sink: SinkId, fd: RawFd) -> io::Result<()> {
        // EV_DELETE on a filter that was never armed returns ENOENT; the
        // kernel still processes the other change, so submit both and
        // ignore the error rather than checking each individually.
        let _ = self.submit(&[
            Self::change(fd as usize, libc::EVFILT_READ, libc::EV_DELETE, 0, sink),
            Self::change(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE, 0, sink),
        ]);
        self.fd_to_sink.remove(&fd);
        Ok(())
    }

    fn arm(&mut self, sink: SinkId, fd: RawFd, direction: Direction) -> io::Result<()> {
        let filter = match direction {
            Direction::Input => libc::EVFILT_READ,
            Direction::Output => libc::EVFILT_WRITE,
        };
        self.submit(&[Self::change(
            fd as usize,
            filter,
            libc::EV_ADD | libc::EV_ONESHOT,
            0,
            sink,
        )])
    }

    fn disable(&mut self, sink: SinkId, fd: RawFd, direction: Direction) -> io::Result<()> {
        let filter = match direction {
            Direction::Input => libc::EVFILT_READ,
            Direction::Output => libc::EVFILT_WRITE,
        };
        let _ = self.submit(&[Self::change(fd as usize, filter, libc::EV_DELETE, 0, sink)]);
        Ok(())
    }

    fn notify(&self) {
        // Safety: triggering our own user filter is safe to race with a
        // concurrent kevent() call blocked on the same kq fd.
        let _ = self.submit(&[Self::change(
            NOTIFY_IDENT,
            libc::EVFILT_USER,
            0,
            libc::NOTE_TRIGGER,
            0,
        )]);
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()> {
        out.clear();
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: i64::from(d.subsec_nanos()),
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const _);

        // Safety: `raw` has capacity MAX_EVENTS and lives for the call.
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.raw.as_mut_ptr(),
                self.raw.len() as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in &self.raw[..n as usize] {
            if raw.filter == libc::EVFILT_USER {
                continue;
            }
            let sink = raw.udata as usize as SinkId;
            let error = raw.flags & libc::EV_ERROR != 0;
            match raw.filter {
                libc::EVFILT_READ => out.push(ReadyEvent { sink, direction: Direction::Input, error }),
                libc::EVFILT_WRITE => out.push(ReadyEvent { sink, direction: Direction::Output, error }),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        // Safety: `kq` is owned exclusively by this backend.
        unsafe {
            libc::close(self.kq);
        }
    }
}
