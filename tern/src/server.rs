// src/server.rs
use crate::config::Config;
use crate::error::{TernError, TernResult};
use crate::files::StaticFiles;
use crate::handler::RequestHandler;
use crate::poller::{Events, Interest, Poller, Selector};
use crate::pool::ThreadPool;
use crate::registry::{Connections, Peer};
use crate::syscalls;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

const MAX_EVENTS: usize = 1024;
const LINGER_SECS: i32 = 1;

/// The event loop: owns the listening socket and the only `wait` call.
pub struct Server {
    listener: OwnedFd,
    local_addr: SocketAddrV4,
    poller: Arc<Poller>,
    connections: Arc<Connections>,
    handler: Arc<RequestHandler>,
    pool: ThreadPool,
    linger: bool,
    shutdown: Arc<AtomicBool>,
}

/// Cloneable remote control for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddrV4,
    poller: Arc<Poller>,
    connections: Arc<Connections>,
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the event loop to stop. Safe from any thread, including signal
    /// handler threads.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.poller.wake() {
            error!(error = %e, "failed to wake event loop for shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Connections currently registered with the event loop.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }
}

impl Server {
    /// Set up every resource the server needs. Nothing is served until
    /// [`Server::run`].
    pub fn bind(config: &Config) -> TernResult<Self> {
        let listener = syscalls::create_listen_socket(SocketAddrV4::new(config.host, config.port))?;
        let local_addr = syscalls::local_addr(listener.as_raw_fd())
            .map_err(|e| TernError::setup("read listening address", e))?;

        let poller = Arc::new(Poller::new()?);
        poller
            .register(listener.as_raw_fd(), Interest::LISTENER)
            .map_err(|e| fatal("register listening socket", e))?;

        let connections = Arc::new(Connections::new(poller.clone()));
        let files = Arc::new(StaticFiles::new(&config.root));
        let handler = Arc::new(RequestHandler::new(
            connections.clone(),
            poller.clone(),
            files,
        ));
        let pool = ThreadPool::new(config.worker_threads())?;

        info!(
            addr = %local_addr,
            workers = config.worker_threads(),
            root = %handler.files().root().display(),
            linger = config.linger,
            "server bound"
        );

        Ok(Self {
            listener,
            local_addr,
            poller,
            connections,
            handler,
            pool,
            linger: config.linger,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            poller: self.poller.clone(),
            connections: self.connections.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run until [`ServerHandle::shutdown`] is called or a fatal error occurs.
    ///
    /// Either way queued requests are finished and every connection is
    /// closed before this returns.
    pub fn run(self) -> TernResult<()> {
        info!("========== Server start ==========");
        let result = self.event_loop();
        if let Err(e) = &result {
            error!(error = %e, "event loop failed");
        }
        self.finish();
        result
    }

    fn event_loop(&self) -> TernResult<()> {
        let listen_fd = self.listener.as_raw_fd();
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !self.shutdown.load(Ordering::Acquire) {
            self.poller.wait(&mut events, None)?;

            for event in events.iter() {
                if event.fd == listen_fd {
                    self.accept_all(listen_fd)?;
                } else if self.poller.is_wake(&event) {
                    self.poller.clear_wake()?;
                    self.connections.drain_close_requests();
                } else {
                    if event.hangup {
                        debug!(fd = event.fd, "peer hung up");
                    }
                    self.dispatch(event.fd);
                }
            }

            self.connections.drain_close_requests();
        }
        Ok(())
    }

    /// Accept until the backlog is empty. Registration failure is fatal.
    ///
    /// The listener is edge-triggered: after a hard accept error the rest of
    /// the backlog waits for the next arrival instead of spinning the loop.
    fn accept_all(&self, listen_fd: RawFd) -> TernResult<()> {
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some((socket, addr))) => {
                    let fd = socket.as_raw_fd();
                    if self.linger {
                        if let Err(e) = syscalls::set_linger(fd, LINGER_SECS) {
                            warn!(peer = %addr, fd, error = %e, "failed to set SO_LINGER");
                        }
                    }
                    self.poller
                        .register(fd, Interest::CLIENT)
                        .map_err(|e| fatal("register client socket", e))?;
                    self.connections.insert(socket, Peer::new(addr, fd));
                }
                Ok(None) => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    debug!(error = %e, "transient accept failure");
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, fd: RawFd) {
        if !self.connections.is_dispatchable(fd) {
            debug!(fd, "stale readiness event skipped");
            return;
        }
        let handler = self.handler.clone();
        if let Err(e) = self.pool.enqueue(move || handler.handle(fd)) {
            warn!(fd, error = %e, "could not dispatch request, closing");
            self.connections.request_close(fd);
        }
    }

    fn finish(&self) {
        debug!(queued = self.pool.queued(), "finishing queued requests");
        self.pool.shutdown();
        let drained = self.connections.drain_close_requests();
        let remaining = self.connections.close_all();
        info!(drained, remaining, "========== Server stop ==========");
    }
}

fn fatal(action: &'static str, err: TernError) -> TernError {
    match err {
        TernError::Io(source) => TernError::setup(action, source),
        other => other,
    }
}
