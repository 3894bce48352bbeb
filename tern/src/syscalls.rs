// src/syscalls.rs
use crate::error::{TernError, TernResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

// ---- Socket Operations ----

/// Create a non-blocking IPv4 TCP listener with SO_REUSEADDR and a SOMAXCONN backlog.
pub fn create_listen_socket(addr: SocketAddrV4) -> TernResult<OwnedFd> {
    unsafe {
        // 1. Atomic non-blocking socket
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(TernError::setup("create socket", io::Error::last_os_error()));
        }
        // Owned from here on, every early return closes it.
        let socket = OwnedFd::from_raw_fd(fd);

        // 2. Fast address reuse after restart
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(TernError::setup("set SO_REUSEADDR", io::Error::last_os_error()));
        }

        // 3. Bind
        let sin = to_sockaddr_in(addr);
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            return Err(TernError::setup("bind socket", io::Error::last_os_error()));
        }

        // 4. Listen with the system maximum backlog
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            return Err(TernError::setup("listen on socket", io::Error::last_os_error()));
        }

        Ok(socket)
    }
}

/// Address the socket is bound to (resolves port 0 after bind).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(from_sockaddr_in(&sin))
    }
}

/// Accept one pending connection without blocking.
///
/// `Ok(None)` means the backlog is empty for now. The accepted socket is
/// already non-blocking and close-on-exec.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(OwnedFd, SocketAddrV4)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some((OwnedFd::from_raw_fd(fd), from_sockaddr_in(&sin))))
        }
    }
}

/// Enable SO_LINGER so close() waits up to `secs` for unsent data.
pub fn set_linger(fd: RawFd, secs: i32) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: secs,
    };
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

fn from_sockaddr_in(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(sin.sin_port),
    )
}

// ---- Wake descriptor ----

/// Create a non-blocking eventfd used to interrupt epoll_wait from other threads.
pub fn create_eventfd() -> io::Result<OwnedFd> {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Bump the eventfd counter. A saturated counter already means "signalled".
pub fn eventfd_signal(fd: RawFd) -> io::Result<()> {
    let val: u64 = 1;
    let res = unsafe {
        libc::write(
            fd,
            &val as *const u64 as *const c_void,
            mem::size_of::<u64>(),
        )
    };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Reset the eventfd counter, returning how many signals were coalesced.
pub fn eventfd_drain(fd: RawFd) -> io::Result<u64> {
    let mut val: u64 = 0;
    let res = unsafe {
        libc::read(
            fd,
            &mut val as *mut u64 as *mut c_void,
            mem::size_of::<u64>(),
        )
    };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(val)
}

// ---- Data transfer ----

/// Single non-blocking read.
///
/// `Ok(0)` is end-of-stream; an empty socket surfaces as `ErrorKind::WouldBlock`.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res as usize);
    }
}

/// Write the whole buffer to a non-blocking socket.
///
/// Uses MSG_NOSIGNAL so a vanished peer yields EPIPE instead of SIGPIPE. When the
/// send buffer is full the call parks in poll(2) for at most `stall` before
/// giving up with `TimedOut`.
pub fn send_all(fd: RawFd, mut buf: &[u8], stall: Duration) -> io::Result<()> {
    while !buf.is_empty() {
        let res = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if !wait_writable(fd, stall)? {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer stopped draining the socket",
                        ));
                    }
                    continue;
                }
                _ => return Err(err),
            }
        }
        buf = &buf[res as usize..];
    }
    Ok(())
}

fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
    loop {
        let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(res > 0);
    }
}
