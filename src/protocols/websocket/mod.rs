//! WebSocket support for the shell.
//!
//! Only the core of RFC 6455 is implemented:
//! - `handshake`: request parsing and the `101 Switching Protocols` reply
//! - `frame`: single, unfragmented text frames plus ping/pong/close
//!
//! ## Wire Format
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key (client frames only)  |    Payload Data ...   |
//! +---------------------------------------+-----------------------+
//! ```

pub mod frame;
pub mod handshake;
