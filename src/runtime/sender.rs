//! Outbound half of a connection.
//!
//! Sending is fire-and-forget: errors that just mean the peer is gone are
//! dropped, anything else is logged and swallowed.

use crate::error::is_teardown;
use crate::protocols::websocket::frame::{self, OP_PONG, OP_TEXT};
use crate::runtime::transport::Transport;
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Write handle given to handlers and used by the codec for replies.
pub struct Sender {
    conn: usize,
    transport: Option<Arc<dyn Transport>>,
    framed: bool,
}

impl Sender {
    pub(crate) fn new(conn: usize, transport: Arc<dyn Transport>) -> Self {
        Self {
            conn,
            transport: Some(transport),
            framed: false,
        }
    }

    /// True once the websocket upgrade has completed.
    pub fn is_framed(&self) -> bool {
        self.framed
    }

    pub(crate) fn set_framed(&mut self) {
        self.framed = true;
    }

    /// Write raw bytes to the peer.
    ///
    /// # Panics
    /// Panics if the transport has already been released.
    pub fn send(&self, data: &[u8]) {
        let transport = self.transport();
        if let Err(e) = transport.write_all(data) {
            self.report(&e, data);
        }
    }

    /// Write `data` as a single final text frame.
    pub fn send_frame(&self, data: &[u8]) {
        self.write_frame(OP_TEXT, data);
    }

    /// Answer a ping with the same payload.
    pub fn send_pong(&self, data: &[u8]) {
        self.write_frame(OP_PONG, data);
    }

    /// Write a text frame after an upgrade, raw bytes before it.
    pub fn reply(&self, data: &[u8]) {
        if self.framed {
            self.send_frame(data);
        } else {
            self.send(data);
        }
    }

    fn write_frame(&self, opcode: u8, data: &[u8]) {
        let (header, len) = frame::encode_header(opcode, data.len());
        let transport = self.transport();
        let result = transport
            .write_all(&header[..len])
            .and_then(|_| transport.write_all(data));
        if let Err(e) = result {
            self.report(&e, data);
        }
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        match &self.transport {
            Some(transport) => transport,
            None => panic!("connection {}: use of transport after it was released", self.conn),
        }
    }

    fn report(&self, err: &std::io::Error, data: &[u8]) {
        if is_teardown(err) {
            return;
        }
        warn!(
            conn = self.conn,
            thread = ?thread::current().id(),
            error = %err,
            attempted = %String::from_utf8_lossy(data),
            "Send failed"
        );
    }

    /// Drop the write handle. Any later send is a programming error.
    pub(crate) fn release(&mut self) -> Option<Arc<dyn Transport>> {
        self.transport.take()
    }
}
