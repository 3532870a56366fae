//! Byte transport underneath a connection.
//!
//! The engine only ever needs blocking reads and writes plus the two
//! teardown operations. Reads and writes go through `&self` so one thread
//! can sit in a blocking read while another shuts the transport down.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

/// A connected, bidirectional byte stream.
pub trait Transport: Send + Sync {
    /// Blocking read. `Ok(0)` means the peer closed its side.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking write, possibly partial.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shut down both directions, waking any thread blocked in `read`.
    fn shutdown(&self) -> io::Result<()>;

    /// Close the transport. Further I/O fails with a bad-descriptor error.
    fn close(&self) -> io::Result<()>;

    /// Remote address, if there is one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Write the whole buffer, draining partial writes.
    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// TCP transport.
///
/// The descriptor itself is released when the last reference is dropped;
/// `close` only marks the stream dead so that a concurrent reader never
/// races a descriptor being reused.
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            peer,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(io::Error::from_raw_os_error(libc::EBADF))
        } else {
            Ok(())
        }
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        (&self.stream).write(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.check_open()?;
        self.stream.shutdown(Shutdown::Both)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
