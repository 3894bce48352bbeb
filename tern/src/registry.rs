// src/registry.rs
use crate::poller::Selector;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// Remote end of a connection, kept for log tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub fd: RawFd,
}

impl Peer {
    pub fn new(addr: SocketAddrV4, fd: RawFd) -> Self {
        Self {
            ip: *addr.ip(),
            port: addr.port(),
            fd,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

struct Connection {
    /// `None` once the socket has been closed.
    socket: Option<OwnedFd>,
    peer: Peer,
}

/// Connection registry plus the deferred-close protocol.
///
/// Any thread may call [`Connections::request_close`]; only the event-loop
/// thread calls [`Connections::drain_close_requests`]. A descriptor present
/// in the registry is registered with the selector. Lock order is entries
/// before pending; neither lock is held across a syscall or a log call.
pub struct Connections {
    selector: Arc<dyn Selector>,
    entries: Mutex<HashMap<RawFd, Connection>>,
    pending: Mutex<HashSet<RawFd>>,
    dirty: AtomicBool,
}

impl Connections {
    pub fn new(selector: Arc<dyn Selector>) -> Self {
        Self {
            selector,
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            dirty: AtomicBool::new(false),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RawFd, Connection>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<RawFd>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of an accepted socket that the caller has already
    /// registered with the selector.
    pub fn insert(&self, socket: OwnedFd, peer: Peer) {
        let previous = self.entries().insert(
            peer.fd,
            Connection {
                socket: Some(socket),
                peer,
            },
        );
        if let Some(stale) = previous {
            // Descriptor numbers are only reused after a drain erased them.
            error!(peer = %stale.peer, fd = peer.fd, "replaced a live registry entry");
        }
        info!(peer = %peer, fd = peer.fd, "client connected");
    }

    pub fn lookup(&self, fd: RawFd) -> Option<Peer> {
        self.entries().get(&fd).map(|c| c.peer)
    }

    /// Registered, still open, and not already waiting to be closed.
    pub fn is_dispatchable(&self, fd: RawFd) -> bool {
        let open = self
            .entries()
            .get(&fd)
            .is_some_and(|c| c.socket.is_some());
        open && !self.pending().contains(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Ask the event loop to tear `fd` down. Repeated requests collapse, and
    /// only the first request after a drain signals the selector.
    pub fn request_close(&self, fd: RawFd) {
        let inserted = self.pending().insert(fd);
        if !inserted {
            return;
        }
        if !self.dirty.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.selector.wake() {
                error!(fd, error = %e, "failed to wake event loop for close");
            }
        }
    }

    /// Tear down every pending connection. Event-loop thread only.
    ///
    /// Returns the number of connections actually closed.
    pub fn drain_close_requests(&self) -> usize {
        // Cleared first so a request racing this drain wakes the next cycle.
        self.dirty.store(false, Ordering::Release);

        let mut closed = 0;
        loop {
            let Some(fd) = self.pending().iter().next().copied() else {
                break;
            };
            if self.teardown(fd) {
                closed += 1;
            }
            self.pending().remove(&fd);
        }
        closed
    }

    /// Unregister, close, then erase. Unknown descriptors are a no-op.
    fn teardown(&self, fd: RawFd) -> bool {
        let Some(peer) = self.lookup(fd) else {
            debug!(fd, "close requested for unknown connection");
            return false;
        };

        if let Err(e) = self.selector.unregister(fd) {
            debug!(peer = %peer, fd, error = %e, "unregister failed");
        }

        let socket = self
            .entries()
            .get_mut(&fd)
            .and_then(|c| c.socket.take());
        drop(socket);

        self.entries().remove(&fd);
        info!(peer = %peer, fd, "client disconnected");
        true
    }

    /// Close everything still registered. Used once the event loop has
    /// stopped.
    pub fn close_all(&self) -> usize {
        let remaining: Vec<RawFd> = self.entries().keys().copied().collect();
        for &fd in &remaining {
            self.request_close(fd);
        }
        self.drain_close_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TernResult;
    use crate::poller::Interest;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeSelector {
        wakes: AtomicUsize,
        unregistered: Mutex<Vec<RawFd>>,
    }

    impl Selector for FakeSelector {
        fn register(&self, _fd: RawFd, _interest: Interest) -> TernResult<()> {
            Ok(())
        }
        fn modify(&self, _fd: RawFd, _interest: Interest) -> TernResult<()> {
            Ok(())
        }
        fn unregister(&self, fd: RawFd) -> TernResult<()> {
            self.unregistered.lock().unwrap().push(fd);
            Ok(())
        }
        fn wake(&self) -> TernResult<()> {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<FakeSelector>, Connections) {
        let selector = Arc::new(FakeSelector::default());
        let conns = Connections::new(selector.clone());
        (selector, conns)
    }

    /// Registers our end of a socket pair; the returned stream is the peer.
    fn connect(conns: &Connections, port: u16) -> (RawFd, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let socket = OwnedFd::from(ours);
        let fd = socket.as_raw_fd();
        conns.insert(socket, Peer::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), fd));
        (fd, theirs)
    }

    fn peer_sees_eof(mut stream: &UnixStream) -> bool {
        use std::io::Read;
        let mut buf = [0u8; 1];
        matches!(stream.read(&mut buf), Ok(0))
    }

    #[test]
    fn peer_formats_as_ip_and_port() {
        let peer = Peer::new(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 4242), 9);
        assert_eq!(peer.to_string(), "10.0.0.7:4242");
    }

    #[test]
    fn duplicate_close_requests_tear_down_once() {
        let (selector, conns) = setup();
        let (fd, remote) = connect(&conns, 1000);

        conns.request_close(fd);
        conns.request_close(fd);
        assert_eq!(conns.pending_len(), 1);
        assert_eq!(selector.wakes.load(Ordering::SeqCst), 1);
        assert!(!conns.is_dispatchable(fd));

        assert_eq!(conns.drain_close_requests(), 1);
        assert_eq!(*selector.unregistered.lock().unwrap(), vec![fd]);
        assert!(conns.lookup(fd).is_none());
        assert!(peer_sees_eof(&remote));

        // Nothing left for a second drain
        assert_eq!(conns.drain_close_requests(), 0);
        assert_eq!(selector.unregistered.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_descriptor_is_silently_skipped() {
        let (selector, conns) = setup();
        conns.request_close(12345);
        assert_eq!(conns.drain_close_requests(), 0);
        assert!(selector.unregistered.lock().unwrap().is_empty());
        assert_eq!(conns.pending_len(), 0);
    }

    #[test]
    fn concurrent_requests_coalesce_into_one_wake() {
        let (selector, conns) = setup();
        let conns = Arc::new(conns);
        let mut remotes = Vec::new();
        let mut fds = Vec::new();
        for port in 0..32 {
            let (fd, remote) = connect(&conns, 2000 + port);
            fds.push(fd);
            remotes.push(remote);
        }

        let handles: Vec<_> = fds
            .iter()
            .map(|&fd| {
                let conns = Arc::clone(&conns);
                std::thread::spawn(move || conns.request_close(fd))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(selector.wakes.load(Ordering::SeqCst), 1);
        assert_eq!(conns.drain_close_requests(), fds.len());
        assert!(conns.is_empty());
        assert_eq!(conns.pending_len(), 0);

        let mut unregistered = selector.unregistered.lock().unwrap().clone();
        unregistered.sort_unstable();
        let mut expected = fds.clone();
        expected.sort_unstable();
        assert_eq!(unregistered, expected);
    }

    #[test]
    fn concurrent_requests_wake_a_blocked_poller_once() {
        use crate::poller::{Events, Poller};
        use std::time::Duration;

        let poller = Arc::new(Poller::new().unwrap());
        let conns = Arc::new(Connections::new(poller.clone()));
        let mut remotes = Vec::new();
        let mut fds = Vec::new();
        for port in 0..16 {
            let (ours, theirs) = UnixStream::pair().unwrap();
            let socket = OwnedFd::from(ours);
            let fd = socket.as_raw_fd();
            poller.register(fd, Interest::CLIENT).unwrap();
            conns.insert(socket, Peer::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3000 + port), fd));
            fds.push(fd);
            remotes.push(theirs);
        }

        let waiter = {
            let poller = Arc::clone(&poller);
            std::thread::spawn(move || {
                let mut events = Events::with_capacity(64);
                poller.wait(&mut events, None).unwrap();
                events
                    .iter()
                    .map(|event| poller.is_wake(&event))
                    .collect::<Vec<_>>()
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let closers: Vec<_> = fds
            .iter()
            .map(|&fd| {
                let conns = Arc::clone(&conns);
                std::thread::spawn(move || conns.request_close(fd))
            })
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }

        assert_eq!(waiter.join().unwrap(), vec![true]);
        assert_eq!(poller.clear_wake().unwrap(), 1);
        assert_eq!(conns.drain_close_requests(), fds.len());
        assert!(conns.is_empty());
        for &fd in &fds {
            assert!(poller.unregister(fd).is_err(), "fd {} still registered", fd);
        }
        for remote in &remotes {
            assert!(peer_sees_eof(remote));
        }
    }

    #[test]
    fn drain_rearms_the_wake_signal() {
        let (selector, conns) = setup();
        let (a, _ra) = connect(&conns, 1);
        let (b, _rb) = connect(&conns, 2);

        conns.request_close(a);
        conns.drain_close_requests();
        conns.request_close(b);
        assert_eq!(selector.wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_all_empties_the_registry() {
        let (_selector, conns) = setup();
        let (_a, ra) = connect(&conns, 1);
        let (_b, rb) = connect(&conns, 2);

        assert_eq!(conns.close_all(), 2);
        assert!(conns.is_empty());
        assert!(peer_sees_eof(&ra));
        assert!(peer_sees_eof(&rb));
    }
}
