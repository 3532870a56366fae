//! Connection lifecycle: read-dispatch loop and teardown.
//!
//! A `Connection` is owned by exactly one worker thread, which runs
//! [`Connection::run`] and destroys the connection when the loop ends.
//! Other threads only ever see the [`ConnectionShared`] half, through which
//! they can read diagnostics or request a shutdown.
//!
//! ```text
//! Start -> Waiting <-> Running -> Closed
//!    \________\__________\_____-> Closing -> Closed
//! ```
//!
//! Transport `shutdown`/`close` are only ever called under the teardown lock,
//! and at most once. Whichever side gets there first does the work; the
//! other finds the transport already closed and does nothing.

use crate::error::{is_teardown, ConnError, ProtocolViolation};
use crate::handler::{Flow, Handler};
use crate::protocols::line;
use crate::protocols::websocket::frame::{self, Opcode, ParseResult};
use crate::protocols::websocket::handshake::{self, Handshake, Step, NOT_IMPLEMENTED};
use crate::runtime::registry::ConnectionRegistry;
use crate::runtime::sender::Sender;
use crate::runtime::transport::Transport;
use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, trace, warn};

/// Consecutive unexpected read errors tolerated before giving up.
const MAX_TRANSIENT_ERRORS: usize = 64;

/// Default read size.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, worker not yet reading.
    Start = 0,
    /// Blocked waiting for bytes from the peer.
    Waiting = 1,
    /// Handler is processing a message.
    Running = 2,
    /// Shutdown requested by another thread.
    Closing = 3,
    /// Destroyed.
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Start,
            1 => ConnState::Waiting,
            2 => ConnState::Running,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    /// Fixed-width label used in the connection report.
    pub fn label(self) -> &'static str {
        match self {
            ConnState::Start => "start",
            ConnState::Waiting => "iwait",
            ConnState::Running => " run ",
            ConnState::Closing => "clsng",
            ConnState::Closed => "close",
        }
    }
}

/// How the byte stream is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Raw telnet/netcat lines.
    Line,
    /// HTTP upgrade, then WebSocket text frames.
    WebSocket,
}

struct Teardown {
    transport: Option<Arc<dyn Transport>>,
    closed: bool,
}

/// The part of a connection visible to other threads.
pub struct ConnectionShared {
    started: DateTime<Utc>,
    tid: AtomicU64,
    state: AtomicU8,
    teardown: Mutex<Teardown>,
}

impl ConnectionShared {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            started: Utc::now(),
            tid: AtomicU64::new(0),
            state: AtomicU8::new(ConnState::Start as u8),
            teardown: Mutex::new(Teardown {
                transport: Some(transport),
                closed: false,
            }),
        }
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// OS thread id of the worker, 0 until it starts.
    pub fn thread_id(&self) -> u64 {
        self.tid.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_closing(&self) -> bool {
        matches!(self.status(), ConnState::Closing | ConnState::Closed)
    }

    /// Move the worker's state, unless a shutdown already claimed it.
    fn transition(&self, to: ConnState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                match ConnState::from_u8(cur) {
                    ConnState::Closing | ConnState::Closed => None,
                    _ => Some(to as u8),
                }
            });
    }

    fn lock_teardown(&self) -> MutexGuard<'_, Teardown> {
        self.teardown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request shutdown from any thread.
    ///
    /// Unblocks the worker's pending read. Safe to call repeatedly and to
    /// race with the worker's own teardown.
    pub fn shutdown(&self) {
        let mut teardown = self.lock_teardown();
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                match ConnState::from_u8(cur) {
                    ConnState::Closed => None,
                    _ => Some(ConnState::Closing as u8),
                }
            });
        if close_locked(&mut teardown) {
            debug!("Connection shut down by request");
        }
    }

    /// Final teardown, run by the owning worker. Returns true if the
    /// transport was closed here rather than by an earlier shutdown.
    fn destroy(&self) -> bool {
        let mut teardown = self.lock_teardown();
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        let closed_here = close_locked(&mut teardown);
        teardown.transport = None;
        closed_here
    }
}

/// Shut down and close the transport once. Caller holds the teardown lock.
fn close_locked(teardown: &mut Teardown) -> bool {
    if teardown.closed {
        return false;
    }
    teardown.closed = true;
    if let Some(transport) = &teardown.transport {
        if let Err(e) = transport.shutdown() {
            log_close_error(&e);
        }
        if let Err(e) = transport.close() {
            log_close_error(&e);
        }
    }
    true
}

fn log_close_error(err: &io::Error) {
    if !is_teardown(err) {
        error!(error = %err, "Error closing socket");
    }
}

/// OS-level id of the calling thread, as shown by `ps -eLf`.
pub(crate) fn current_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        // SAFETY: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as usize as u64 }
    }
}

/// A single client connection, owned by its worker thread.
pub struct Connection {
    key: usize,
    shared: Arc<ConnectionShared>,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    sender: Sender,
    handler: Box<dyn Handler>,
    mode: Mode,
    handshake: Handshake,
    buffer: BytesMut,
    read_size: usize,
    eof: bool,
    transient_errors: usize,
}

impl Connection {
    /// Create and register a connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn accept(
        registry: &Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        mode: Mode,
        handler: Box<dyn Handler>,
        read_size: usize,
    ) -> Option<Self> {
        let shared = Arc::new(ConnectionShared::new(transport.clone()));
        let key = registry.register(&shared)?;
        Some(Self {
            key,
            shared,
            registry: Arc::clone(registry),
            sender: Sender::new(key, transport.clone()),
            transport,
            handler,
            mode,
            handshake: Handshake::new(),
            buffer: BytesMut::with_capacity(read_size),
            read_size: read_size.max(1),
            eof: false,
            transient_errors: 0,
        })
    }

    /// Registry key, also used as the connection id in logs.
    pub fn key(&self) -> usize {
        self.key
    }

    /// Handle for shutting this connection down from another thread.
    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<ConnectionShared> {
        Arc::clone(&self.shared)
    }

    /// Run the read-dispatch loop to completion, then destroy the connection.
    pub fn run(mut self) {
        self.shared.tid.store(current_thread_id(), Ordering::Relaxed);
        debug!(
            conn = self.key,
            peer = ?self.transport.peer_addr(),
            mode = ?self.mode,
            "Connection started"
        );

        match self.serve() {
            Ok(()) | Err(ConnError::Teardown(_)) => {
                debug!(conn = self.key, "Connection closed");
            }
            Err(ConnError::PeerClosed) => {
                info!(conn = self.key, "Received WebSocket close");
            }
            Err(ConnError::Protocol(violation)) => {
                warn!(conn = self.key, %violation, "Dropping connection");
            }
            Err(ConnError::Transient(e)) => {
                error!(conn = self.key, error = %e, "Giving up on connection");
            }
            Err(ConnError::Aborted { reason, log }) => {
                if log {
                    info!(conn = self.key, %reason, "Connection aborted");
                } else {
                    debug!(conn = self.key, %reason, "Connection aborted");
                }
            }
        }
    }

    fn serve(&mut self) -> Result<(), ConnError> {
        if self.mode == Mode::Line {
            let flow = self.handler.on_connected(&self.sender, None);
            check(flow)?;
        }

        loop {
            let message = if self.sender.is_framed() {
                self.next_frame()?
            } else {
                self.next_line()?
            };
            let Some(message) = message else {
                return Ok(());
            };

            if self.mode == Mode::WebSocket && !self.sender.is_framed() {
                self.handshake_line(&message)?;
                continue;
            }

            self.shared.transition(ConnState::Running);
            let flow = self.handler.on_message(&self.sender, &message);
            check(flow)?;
        }
    }

    fn handshake_line(&mut self, line: &[u8]) -> Result<(), ConnError> {
        match self.handshake.feed(line) {
            Step::Continue => Ok(()),
            Step::Reject(violation) => {
                self.sender.send(NOT_IMPLEMENTED);
                Err(violation.into())
            }
            Step::HeadersDone => {
                let flow = self
                    .handler
                    .on_connected(&self.sender, Some(self.handshake.request()));
                check(flow)?;

                let request = self.handshake.request();
                if !request.upgrade {
                    return Err(ProtocolViolation::MissingUpgrade.into());
                }
                let response = handshake::switching_protocols(&request.key);
                self.sender.send(response.as_bytes());
                self.sender.set_framed();
                debug!(
                    conn = self.key,
                    path = %request.path,
                    state = ?self.handshake.state(),
                    "WebSocket upgrade complete"
                );
                Ok(())
            }
        }
    }

    /// Next telnet-delimited line, or `None` once the stream is done.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        loop {
            if let Some(boundary) = line::find_boundary(&self.buffer) {
                return Ok(Some(line::take_line(&mut self.buffer, boundary)));
            }
            let filled = match self.fill() {
                Ok(n) => n,
                Err(ConnError::Teardown(e)) => {
                    debug!(conn = self.key, error = %e, "Read ended");
                    0
                }
                Err(e) => return Err(e),
            };
            if filled == 0 {
                // Unterminated input, e.g. from netcat, still counts as a
                // line however the stream ended.
                return Ok(line::take_remainder(&mut self.buffer));
            }
        }
    }

    /// Next text frame payload. Pings are answered, pongs dropped.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        loop {
            match frame::parse(&self.buffer) {
                ParseResult::Complete(frame, consumed) => {
                    self.buffer.advance(consumed);
                    trace!(
                        conn = self.key,
                        opcode = ?frame.opcode,
                        fin = frame.fin,
                        masked = frame.is_masked(),
                        len = frame.payload.len(),
                        "Frame received"
                    );
                    match frame.opcode {
                        Opcode::Ping => self.sender.send_pong(&frame.payload),
                        Opcode::Pong => {}
                        _ => return Ok(Some(frame.payload)),
                    }
                }
                ParseResult::Incomplete => {
                    if self.fill()? == 0 {
                        return Ok(None);
                    }
                }
                ParseResult::Close => return Err(ConnError::PeerClosed),
                ParseResult::Error(violation) => return Err(violation.into()),
            }
        }
    }

    /// Read more bytes into the buffer. `Ok(0)` means end of stream.
    fn fill(&mut self) -> Result<usize, ConnError> {
        if self.eof {
            return Ok(0);
        }

        loop {
            self.shared.transition(ConnState::Waiting);

            let start = self.buffer.len();
            self.buffer.resize(start + self.read_size, 0);
            let result = self.transport.read(&mut self.buffer[start..]);
            let n = *result.as_ref().unwrap_or(&0);
            self.buffer.truncate(start + n);

            match result {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.transient_errors = 0;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_teardown(&e) || self.shared.is_closing() => {
                    self.eof = true;
                    return Err(ConnError::Teardown(e));
                }
                Err(e) => {
                    error!(conn = self.key, error = %e, "Error reading data");
                    self.transient_errors += 1;
                    if self.transient_errors >= MAX_TRANSIENT_ERRORS {
                        return Err(ConnError::Transient(e));
                    }
                }
            }
        }
    }
}

fn check(flow: Flow) -> Result<(), ConnError> {
    match flow {
        Flow::Continue => Ok(()),
        Flow::Abort { reason, log } => Err(ConnError::Aborted { reason, log }),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.sender.release();
        let closed_here = self.shared.destroy();
        self.registry.deregister(self.key);
        debug!(conn = self.key, closed_here, "Connection destroyed");
    }
}
