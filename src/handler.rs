//! The seam between the connection engine and whatever interprets input.

use crate::protocols::websocket::handshake::UpgradeRequest;
use crate::runtime::{Mode, Sender};

/// What the read-dispatch loop should do after a handler callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// End the connection. `log` decides whether this is reported at info.
    Abort { reason: String, log: bool },
}

impl Flow {
    /// End the connection without logging.
    pub fn quiet(reason: impl Into<String>) -> Self {
        Flow::Abort {
            reason: reason.into(),
            log: false,
        }
    }
}

/// Per-connection consumer of decoded messages.
///
/// Callbacks run on the connection's worker thread, one at a time, in
/// arrival order.
pub trait Handler: Send {
    /// Called once: immediately for a line connection, or after the HTTP
    /// header block for a websocket connection (with the parsed request).
    fn on_connected(&mut self, out: &Sender, request: Option<&UpgradeRequest>) -> Flow;

    /// Called once per line or text frame.
    fn on_message(&mut self, out: &Sender, message: &[u8]) -> Flow;
}

/// Creates a handler for each accepted connection.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, mode: Mode) -> Box<dyn Handler>;
}
