// src/lib.rs
pub mod cache;
pub mod config;
pub mod error;
pub mod files;
pub mod form;
pub mod handler;
pub mod http;
pub mod listing;
pub mod logging;
pub mod parser;
pub mod poller;
pub mod pool;
pub mod registry;
pub mod server;
pub mod syscalls;

// Re-exports for users
pub use config::{Config, LogLevel};
pub use error::{TernError, TernResult};
pub use files::StaticFiles;
pub use http::{Method, Response};
pub use logging::init_logging;
pub use server::{Server, ServerHandle};
