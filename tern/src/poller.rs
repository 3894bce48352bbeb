// src/poller.rs
//! Readiness monitor: an epoll instance plus an always-registered eventfd that
//! lets any thread interrupt a blocked [`Poller::wait`].

use crate::error::{TernError, TernResult};
use crate::syscalls;
use libc::{c_int, epoll_event};
use std::io;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Event interest mask passed to epoll_ctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    /// Disarm after one report; re-arm with [`Selector::modify`].
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    /// Accepted client sockets: readable, one report per arm.
    pub const CLIENT: Interest = Interest::READABLE.union(Interest::ONESHOT);
    /// Listening socket: reported once per new arrival, so a backlog that
    /// cannot be accepted (EMFILE) does not keep `wait` returning.
    pub const LISTENER: Interest = Interest::READABLE.union(Interest::EDGE);

    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

/// The narrow contract other components need from the readiness monitor.
///
/// The connection registry only ever unregisters and wakes; request handlers
/// only re-arm. Keeping this a trait lets both be driven by a fake in tests.
pub trait Selector: Send + Sync {
    fn register(&self, fd: RawFd, interest: Interest) -> TernResult<()>;
    fn modify(&self, fd: RawFd, interest: Interest) -> TernResult<()>;
    fn unregister(&self, fd: RawFd) -> TernResult<()>;
    /// Make a pending or future `wait` return promptly. Callable from any thread.
    fn wake(&self) -> TernResult<()>;
}

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    /// Peer hung up or the socket is in an error state.
    pub hangup: bool,
}

/// Reusable buffer of readiness reports for one wait cycle.
pub struct Events {
    buf: Vec<epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reports in the order the kernel returned them.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.len].iter().map(|raw| {
            // epoll_event is packed on x86_64: copy fields out, never borrow them.
            let bits = { raw.events };
            let token = { raw.u64 };
            Event {
                fd: token as RawFd,
                hangup: bits & (libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32 != 0,
            }
        })
    }
}

pub struct Poller {
    epoll: OwnedFd,
    waker: OwnedFd,
}

impl Poller {
    /// Create the epoll instance and register the wake descriptor.
    pub fn new() -> TernResult<Self> {
        let epoll = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(TernError::setup(
                    "create epoll instance",
                    io::Error::last_os_error(),
                ));
            }
            OwnedFd::from_raw_fd(fd)
        };
        let waker =
            syscalls::create_eventfd().map_err(|e| TernError::setup("create eventfd", e))?;

        let poller = Self { epoll, waker };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.waker.as_raw_fd(),
            Interest::READABLE,
        )?;
        Ok(poller)
    }

    pub fn is_wake(&self, event: &Event) -> bool {
        event.fd == self.waker.as_raw_fd()
    }

    /// Consume pending wake signals so the level-triggered waker goes quiet.
    pub fn clear_wake(&self) -> TernResult<u64> {
        Ok(syscalls::eventfd_drain(self.waker.as_raw_fd())?)
    }

    /// Block until something is ready or `timeout` elapses (`None` blocks indefinitely).
    ///
    /// An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> TernResult<usize> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
            None => -1,
        };
        let res = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.buf.as_mut_ptr(),
                events.buf.len() as c_int,
                timeout_ms,
            )
        };

        if res < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err.into());
        }

        events.len = res as usize;
        Ok(events.len)
    }

    fn ctl(&self, op: c_int, fd: RawFd, interest: Interest) -> TernResult<()> {
        let mut event = epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Selector for Poller {
    fn register(&self, fd: RawFd, interest: Interest) -> TernResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> TernResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn unregister(&self, fd: RawFd) -> TernResult<()> {
        let res =
            unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn wake(&self) -> TernResult<()> {
        Ok(syscalls::eventfd_signal(self.waker.as_raw_fd())?)
    }
}
