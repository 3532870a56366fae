//! Blocking, thread-per-connection runtime.
//!
//! Each accepted socket gets its own worker thread that owns the
//! connection for its whole life:
//! - `Transport`: byte stream the worker reads and writes
//! - `Connection`: read-dispatch loop and teardown protocol
//! - `Sender`: fire-and-forget writes for handlers and the codec
//! - `ConnectionRegistry`: live connections, for reports and server stop

mod connection;
mod registry;
mod sender;
mod transport;

pub use connection::{Connection, Mode, DEFAULT_READ_SIZE};
pub use registry::ConnectionRegistry;
pub use sender::Sender;
pub use transport::{TcpTransport, Transport};

#[cfg(test)]
pub(crate) use registry::REPORT_HEADER;
#[cfg(test)]
pub(crate) use transport::mock;
