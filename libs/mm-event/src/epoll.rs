//! Linux backend: one `epoll_fd` per dispatcher, `eventfd` for notify.

use crate::backend::{Backend, Direction, ReadyEvent, SinkId, MAX_EVENTS};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

struct Interest {
    readable: bool,
    writable: bool,
}

pub struct EpollBackend {
    epoll_fd: RawFd,
    notify_fd: RawFd,
    interests: HashMap<RawFd, Interest>,
    fd_to_sink: HashMap<RawFd, SinkId>,
    raw: Vec<libc::epoll_event>,
}

impl EpollBackend {
    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn mask(interest: &Interest) -> u32 {
        let mut m = libc::EPOLLET as u32 | libc::EPOLLRDHUP as u32;
        if interest.readable {
            m |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            m |= libc::EPOLLOUT as u32;
        }
        m
    }

    fn remask(&self, fd: RawFd) -> io::Result<()> {
        let interest = self
            .interests
            .get(&fd)
            .expect("remask on an unregistered fd");
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::mask(interest))
    }
}

impl Backend for EpollBackend {
    fn new() -> io::Result<Self> {
        // Safety: plain syscalls, errors are checked below.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let notify_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if notify_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let backend = Self {
            epoll_fd,
            notify_fd,
            interests: HashMap::new(),
            fd_to_sink: HashMap::new(),
            // Safety: a zeroed epoll_event is a valid bit pattern.
            raw: vec![unsafe { std::mem::zeroed() }; MAX_EVENTS],
        };
        backend.ctl(libc::EPOLL_CTL_ADD, notify_fd, libc::EPOLLIN as u32)?;
        Ok(backend)
    }

    fn register_sink(
        &mut self,
        sink: SinkId,
        fd: RawFd,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let interest = Interest { readable, writable };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::mask(&interest))?;
        self.interests.insert(fd, interest);
        self.fd_to_sink.insert(fd, sink);
        Ok(())
    }

    fn unregister_sink(&mut self, _sink: SinkId, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        self.interests.remove(&fd);
        self.fd_to_sink.remove(&fd);
        if ret < 0 {
            let err = io::Error::last_os_error();
            // The fd may already be gone if the caller closed it first.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    fn arm(&mut self, _sink: SinkId, fd: RawFd, direction: Direction) -> io::Result<()> {
        if let Some(interest) = self.interests.get_mut(&fd) {
            match direction {
                Direction::Input => interest.readable = true,
                Direction::Output => interest.writable = true,
            }
        }
        self.remask(fd)
    }

    fn disable(&mut self, _sink: SinkId, fd: RawFd, direction: Direction) -> io::Result<()> {
        if let Some(interest) = self.interests.get_mut(&fd) {
            match direction {
                Direction::Input => interest.readable = false,
                Direction::Output => interest.writable = false,
            }
        }
        self.remask(fd)
    }

    fn notify(&self) {
        let one: u64 = 1;
        // Safety: `notify_fd` is a valid eventfd for the lifetime of self;
        // writing to it is safe to race with a concurrent epoll_wait.
        unsafe {
            libc::write(self.notify_fd, &one as *const u64 as *const _, 8);
        }
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()> {
        out.clear();
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };

        // Safety: `raw` has capacity MAX_EVENTS and lives for the call.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.raw.as_mut_ptr(),
                self.raw.len() as i32,
                timeout_ms,
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
            let fd = raw.u64 as RawFd;
            if fd == self.notify_fd {
                let mut buf = [0u8; 8];
                // Safety: draining the eventfd counter so the next wait
                // blocks again.
                unsafe {
                    libc::read(self.notify_fd, buf.as_mut_ptr().cast(), 8);
                }
                continue;
            }
            let Some(&sink) = self.fd_to_sink.get(&fd) else {
                continue;
            };
            let events = raw.events;
            let error = events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
            if events & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32) != 0 || error {
                out.push(ReadyEvent { sink, direction: Direction::Input, error });
            }
            if events & libc::EPOLLOUT as u32 != 0 || error {
                out.push(ReadyEvent { sink, direction: Direction::Output, error });
            }
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // Safety: both fds are owned exclusively by this backend.
        unsafe {
            libc::close(self.notify_fd);
            libc::close(self.epoll_fd);
        }
    }
}
