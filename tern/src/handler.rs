// src/handler.rs
use crate::files::StaticFiles;
use crate::form;
use crate::http::{Method, Response};
use crate::parser::{self, Request};
use crate::poller::{Interest, Selector};
use crate::registry::Connections;
use crate::syscalls;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

pub const READ_BUF_SIZE: usize = 4096;

/// How long a send may wait on a full socket buffer before the peer is
/// treated as gone.
const SEND_STALL: Duration = Duration::from_secs(5);

/// Worker-side request state machine. One call to [`RequestHandler::handle`]
/// per readiness event; every path that read data ends in a close request.
pub struct RequestHandler {
    connections: Arc<Connections>,
    selector: Arc<dyn Selector>,
    files: Arc<StaticFiles>,
}

impl RequestHandler {
    pub fn new(
        connections: Arc<Connections>,
        selector: Arc<dyn Selector>,
        files: Arc<StaticFiles>,
    ) -> Self {
        Self {
            connections,
            selector,
            files,
        }
    }

    pub fn files(&self) -> &StaticFiles {
        &self.files
    }

    pub fn handle(&self, fd: RawFd) {
        let Some(peer) = self.connections.lookup(fd) else {
            debug!(fd, "connection vanished before its task ran");
            return;
        };
        let span = info_span!("conn", peer = %peer, fd);
        let _enter = span.enter();

        let mut buf = [0u8; READ_BUF_SIZE];
        match syscalls::read_nonblocking(fd, &mut buf) {
            Ok(0) => {
                info!("client closed the connection");
                self.connections.request_close(fd);
            }
            Ok(n) => {
                let response = self.respond(&buf[..n]);
                if let Err(e) = syscalls::send_all(fd, &response.to_bytes(), SEND_STALL) {
                    warn!(error = %e, "failed to send response");
                }
                self.connections.request_close(fd);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("spurious wakeup, re-arming");
                if let Err(e) = self.selector.modify(fd, Interest::CLIENT) {
                    error!(error = %e, "failed to re-arm connection");
                    self.connections.request_close(fd);
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                warn!("descriptor already closed");
                self.connections.request_close(fd);
            }
            Err(e) => {
                info!(error = %e, "read failed, closing");
                self.connections.request_close(fd);
            }
        }
    }

    /// Turn raw request bytes into a response.
    pub fn respond(&self, raw: &[u8]) -> Arc<Response> {
        let request = match parser::parse_request(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = ?e, "malformed request line");
                return Arc::new(Response::error(400));
            }
        };

        let response = match request.method {
            Method::Get => self.files.serve(request.path),
            Method::Post => Arc::new(handle_post(&request)),
            _ => Arc::new(Response::error_with_hint(
                405,
                &format!("Method {} is not allowed.", request.method_name),
            )),
        };
        info!(
            method = request.method_name,
            path = request.path,
            query = request.query.unwrap_or(""),
            status = response.status,
            "request served"
        );
        response
    }
}

fn handle_post(request: &Request<'_>) -> Response {
    let Some(body) = request.body else {
        warn!("POST without header terminator");
        return Response::error_with_hint(400, "The request body could not be located.");
    };

    match form::parse(body) {
        Ok(data) if data.is_empty() => Response::text("No form data received."),
        Ok(data) => Response::text(form::describe(&data)),
        Err(e) => {
            warn!(error = %e, "undecodable form body");
            Response::error(400)
        }
    }
}
