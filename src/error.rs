//! Error surface of the agent

use std::io;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors returned by the public agent API.
///
/// Per-connection I/O failures never surface here; they are reported once,
/// asynchronously, through [`AgentHandler::on_close`](crate::AgentHandler::on_close).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A configuration value is outside its permitted range.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The operation is not permitted in the agent's or the connection's
    /// current state.
    #[error("operation not permitted in the current state")]
    IllegalState,

    /// Creating a socket failed.
    #[error("socket creation failed")]
    SocketCreate(#[source] io::Error),

    /// Binding a local address failed.
    #[error("socket bind failed")]
    SocketBind(#[source] io::Error),

    /// Spawning a dispatcher worker thread failed.
    #[error("worker thread creation failed")]
    WorkerThreadCreate(#[source] io::Error),

    /// Starting the garbage-collection timer failed.
    #[error("gc timer start failed")]
    GcStart(#[source] io::Error),

    /// No live connection carries the given identifier.
    #[error("connection not found")]
    ObjectNotFound,

    /// The configured connection-count limit is reached.
    #[error("connection count limit reached")]
    ConnectionCountLimit,

    /// A user callback vetoed the operation.
    #[error("cancelled by handler")]
    Cancelled,

    /// Raw platform error from the socket layer.
    #[error("i/o error")]
    Io(#[from] io::Error),
}

/// The error handed to `on_close` when a mid-stream callback vetoes a
/// connection.
pub(crate) fn cancelled_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "cancelled by handler")
}
