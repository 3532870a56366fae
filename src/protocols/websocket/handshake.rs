//! HTTP side of the WebSocket upgrade.
//!
//! The request arrives through the line framer one line at a time. Header
//! matching is deliberately literal and case-sensitive.

use crate::error::ProtocolViolation;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::{Digest, Sha1};

/// WebSocket magic string for handshake
pub const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Reply to anything that is not a GET.
pub const NOT_IMPLEMENTED: &[u8] = b"HTTP/1.1 501 Not Implemented\r\nServer: CogServer\r\n\r\n";

const UPGRADE_HEADER: &[u8] = b"Upgrade: websocket";
const KEY_HEADER: &[u8] = b"Sec-WebSocket-Key: ";

/// Where the header exchange currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NeedRequestLine,
    ReadingHeaders,
    HeadersDone,
}

/// What was learned from the client's request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target from the `GET` line.
    pub path: String,
    /// Saw `Upgrade: websocket`.
    pub upgrade: bool,
    /// Value of `Sec-WebSocket-Key`, verbatim.
    pub key: String,
}

/// Outcome of feeding one request line.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The blank line ending the header block was seen.
    HeadersDone,
    Reject(ProtocolViolation),
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    request: UpgradeRequest,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::NeedRequestLine,
            request: UpgradeRequest::default(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// Consume one CR-stripped request line.
    pub fn feed(&mut self, line: &[u8]) -> Step {
        match self.state {
            HandshakeState::NeedRequestLine => {
                let Some(target) = line.strip_prefix(b"GET ") else {
                    return Step::Reject(ProtocolViolation::MalformedRequestLine);
                };
                let end = target.iter().position(|&b| b == b' ').unwrap_or(target.len());
                self.request.path = String::from_utf8_lossy(&target[..end]).into_owned();
                self.state = HandshakeState::ReadingHeaders;
                Step::Continue
            }
            HandshakeState::ReadingHeaders => {
                if line.is_empty() {
                    self.state = HandshakeState::HeadersDone;
                    return Step::HeadersDone;
                }
                if line.starts_with(UPGRADE_HEADER) {
                    self.request.upgrade = true;
                } else if let Some(key) = line.strip_prefix(KEY_HEADER) {
                    self.request.key = String::from_utf8_lossy(key).into_owned();
                }
                Step::Continue
            }
            HandshakeState::HeadersDone => Step::HeadersDone,
        }
    }
}

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response for a client key.
pub fn switching_protocols(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key)
    )
}
