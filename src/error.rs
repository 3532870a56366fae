//! Error types for connection handling.
//!
//! Everything in here is handled inside the connection's own worker thread.
//! The variant decides how loudly the end of a connection gets logged.

use std::io;
use thiserror::Error;

/// Reasons a WebSocket or HTTP peer is cut off.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("websocket frame from client is not masked")]
    UnmaskedFrame,
    #[error("websocket frame length {0} exceeds sanity bound")]
    OversizedFrame(u64),
    #[error("unsupported websocket opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("malformed HTTP request line")]
    MalformedRequestLine,
    #[error("request did not ask for a websocket upgrade")]
    MissingUpgrade,
}

/// Terminal conditions of a connection's read-dispatch loop.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Transport went away underneath us (EOF, reset, shutdown by another thread).
    #[error("transport closed: {0}")]
    Teardown(#[source] io::Error),

    /// Peer sent a websocket close frame.
    #[error("peer sent websocket close")]
    PeerClosed,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Read kept failing with unexpected errors.
    #[error("giving up after repeated read errors: {0}")]
    Transient(#[source] io::Error),

    /// The handler asked to end the session.
    #[error("aborted: {reason}")]
    Aborted { reason: String, log: bool },
}

/// Errors that are expected while a connection is being torn down.
///
/// Covers graceful close, reset, not-connected, broken pipe and a descriptor
/// that has already been closed.
pub fn is_teardown(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => true,
        _ => err.raw_os_error() == Some(libc::EBADF),
    }
}
