//! User-facing event callbacks

use std::io;

use crate::conn::ConnId;

/// Verdict returned by event callbacks that may veto an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Proceed.
    Continue,
    /// Veto: the agent cancels the operation (see each callback for the
    /// exact consequence).
    Error,
}

/// The operation a close was attributed to, reported through
/// [`AgentHandler::on_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Close requested locally or by the peer.
    Close,
    /// Failure while establishing the connection.
    Connect,
    /// Failure on the send path.
    Send,
    /// Failure on the receive path.
    Receive,
    /// Origin could not be attributed.
    Unknown,
}

/// Event sink implemented by the application.
///
/// Callbacks run on dispatcher worker threads (and, for a synchronous
/// connect, on the calling thread); they must not block for long or every
/// connection pinned to that worker stalls. All methods except `on_receive`
/// have permissive defaults.
pub trait AgentHandler: Send + Sync + 'static {
    /// Fired after a slot is reserved but before `connect` is issued; the raw
    /// socket may be tuned here. Returning [`HandleResult::Error`] cancels
    /// the attempt without an `on_close`.
    fn on_prepare_connect(&self, conn_id: ConnId, socket: &socket2::Socket) -> HandleResult {
        let _ = (conn_id, socket);
        HandleResult::Continue
    }

    /// Fired once the connection is established, strictly before any
    /// `on_receive`/`on_send`. Returning an error closes the connection
    /// silently (no `on_close`).
    fn on_connect(&self, conn_id: ConnId) -> HandleResult {
        let _ = conn_id;
        HandleResult::Continue
    }

    /// A chunk of the inbound byte stream, delivered in stream order.
    /// Returning an error closes the connection with `Operation::Receive`.
    fn on_receive(&self, conn_id: ConnId, data: &[u8]) -> HandleResult;

    /// Bytes accepted by the kernel, reported in submission order. An error
    /// verdict is logged and ignored: the bytes are already on the wire.
    fn on_send(&self, conn_id: ConnId, data: &[u8]) -> HandleResult {
        let _ = (conn_id, data);
        HandleResult::Continue
    }

    /// Final event for a connection, delivered exactly once. `error` is
    /// `None` for a clean close.
    fn on_close(&self, conn_id: ConnId, operation: Operation, error: Option<io::Error>);

    /// The agent finished stopping; every connection is already closed.
    fn on_shutdown(&self) {}
}
