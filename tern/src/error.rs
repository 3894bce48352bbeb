use std::io;
use thiserror::Error;

/// Central error type for the tern engine.
///
/// Only setup and lifecycle failures travel through this type. Per-request
/// problems (bad request line, missing file, unsupported method) are answered
/// in-band with an HTTP status code and never surface here.
#[derive(Debug, Error)]
pub enum TernError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A startup step (socket, bind, listen, epoll, eventfd, registration) failed.
    #[error("failed to {action}: {source}")]
    Setup {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    /// The worker pool no longer accepts tasks.
    #[error("worker pool has been stopped, cannot enqueue new tasks")]
    PoolStopped,

    /// A configuration value could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The log sink could not be set up.
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

impl TernError {
    pub(crate) fn setup(action: &'static str, source: io::Error) -> Self {
        TernError::Setup { action, source }
    }
}

pub type TernResult<T> = Result<T, TernError>;
