//! Protocol implementations.
//!
//! Both are parsers over the connection's receive buffer, used by the
//! runtime's read-dispatch loop.
//!
//! - `line`: telnet-aware line framing for the console port
//! - `websocket`: HTTP upgrade handshake and text frame codec

pub mod line;
pub mod websocket;
