//! WebSocket frame codec (RFC 6455, single text frames only).
//!
//! Decoding works over the connection's receive buffer and never consumes
//! anything until a whole frame is present. Fragmented and binary messages
//! are rejected outright.

use crate::error::ProtocolViolation;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// Largest payload length accepted from a 64-bit length field.
pub const MAX_FRAME_LEN: u64 = 1 << 40;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(op: u8) -> Self {
        match op & 0x0f {
            OP_CONTINUATION => Opcode::Continuation,
            OP_TEXT => Opcode::Text,
            OP_BINARY => Opcode::Binary,
            OP_CLOSE => Opcode::Close,
            OP_PING => Opcode::Ping,
            OP_PONG => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }
}

/// A decoded client frame. The payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub fin: bool,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A text, ping or pong frame and the bytes it occupied.
    Complete(Frame, usize),
    /// Need more data.
    Incomplete,
    /// Peer sent a close frame.
    Close,
    /// Frame breaks the rules; the connection must be dropped.
    Error(ProtocolViolation),
}

/// Parse one client frame from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    let Some(&b0) = input.first() else {
        return ParseResult::Incomplete;
    };
    let opcode = Opcode::from(b0);
    match opcode {
        Opcode::Text | Opcode::Ping | Opcode::Pong => {}
        Opcode::Close => return ParseResult::Close,
        _ => return ParseResult::Error(ProtocolViolation::UnsupportedOpcode(b0 & 0x0f)),
    }

    let Some(&b1) = input.get(1) else {
        return ParseResult::Incomplete;
    };

    let (len, mut pos) = match b1 & 0x7f {
        126 => {
            if input.len() < 4 {
                return ParseResult::Incomplete;
            }
            (u64::from(u16::from_be_bytes([input[2], input[3]])), 4)
        }
        127 => {
            if input.len() < 10 {
                return ParseResult::Incomplete;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&input[2..10]);
            let len = u64::from_be_bytes(raw);
            if len > MAX_FRAME_LEN {
                return ParseResult::Error(ProtocolViolation::OversizedFrame(len));
            }
            (len, 10)
        }
        n => (u64::from(n), 2),
    };

    if b1 & MASK_BIT == 0 {
        return ParseResult::Error(ProtocolViolation::UnmaskedFrame);
    }

    if input.len() < pos + 4 {
        return ParseResult::Incomplete;
    }
    let mask = [input[pos], input[pos + 1], input[pos + 2], input[pos + 3]];
    pos += 4;

    let Ok(len) = usize::try_from(len) else {
        return ParseResult::Error(ProtocolViolation::OversizedFrame(len));
    };
    if input.len() - pos < len {
        return ParseResult::Incomplete;
    }

    let mut payload = input[pos..pos + len].to_vec();
    apply_mask(&mut payload, mask);

    ParseResult::Complete(
        Frame {
            opcode,
            fin: b0 & FIN_BIT != 0,
            mask: Some(mask),
            payload,
        },
        pos + len,
    )
}

/// XOR `data` with the repeating 4-byte `key`, a word at a time.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let v = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    for (byte, k) in chunks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}

/// Build an unmasked server frame header for a final frame of `opcode`.
///
/// Returns the header buffer and how many of its bytes are used (2, 4 or 10).
pub fn encode_header(opcode: u8, len: usize) -> ([u8; 10], usize) {
    let mut header = [0u8; 10];
    header[0] = FIN_BIT | (opcode & 0x0f);
    if len < 126 {
        header[1] = len as u8;
        (header, 2)
    } else if len < 65536 {
        header[1] = 126;
        header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        (header, 4)
    } else {
        header[1] = 127;
        header[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        (header, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    /// Server-encode `payload`, then rewrite it the way a client would send it.
    fn client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let (header, len) = encode_header(opcode, payload.len());
        let mut out = header[..len].to_vec();
        out[1] |= MASK_BIT;
        out.extend_from_slice(&KEY);
        let mut body = payload.to_vec();
        apply_mask(&mut body, KEY);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(encode_header(OP_TEXT, 0).1, 2);
        assert_eq!(encode_header(OP_TEXT, 125).1, 2);
        assert_eq!(encode_header(OP_TEXT, 126).1, 4);
        assert_eq!(encode_header(OP_TEXT, 65535).1, 4);
        assert_eq!(encode_header(OP_TEXT, 65536).1, 10);

        let (h, n) = encode_header(OP_TEXT, 300);
        assert_eq!(&h[..n], &[0x81, 126, 0x01, 0x2c]);

        let (h, n) = encode_header(OP_TEXT, 65536);
        assert_eq!(&h[..n], &[0x81, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_round_trip_length_boundaries() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = client_frame(OP_TEXT, &payload);
            match parse(&wire) {
                ParseResult::Complete(frame, consumed) => {
                    assert_eq!(consumed, wire.len(), "len {len}");
                    assert_eq!(frame.opcode, Opcode::Text);
                    assert!(frame.fin);
                    assert_eq!(frame.mask, Some(KEY));
                    assert_eq!(frame.payload, payload, "len {len}");
                }
                other => panic!("len {len}: unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7 example.
        let wire = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        match parse(&wire) {
            ParseResult::Complete(frame, 11) => assert_eq!(frame.payload, b"Hello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_at_every_prefix() {
        let wire = client_frame(OP_TEXT, &[7u8; 200]);
        for cut in 0..wire.len() {
            match parse(&wire[..cut]) {
                ParseResult::Incomplete => {}
                other => panic!("cut {cut}: unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_unmasked_rejected() {
        let (header, len) = encode_header(OP_TEXT, 3);
        let mut wire = header[..len].to_vec();
        wire.extend_from_slice(b"abc");
        match parse(&wire) {
            ParseResult::Error(ProtocolViolation::UnmaskedFrame) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_rejected_before_payload() {
        let mut wire = vec![0x81, 0xff];
        wire.extend_from_slice(&((1u64 << 40) + 1).to_be_bytes());
        match parse(&wire) {
            ParseResult::Error(ProtocolViolation::OversizedFrame(n)) => assert_eq!(n, (1 << 40) + 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_opcodes() {
        match parse(&[0x82, 0x80]) {
            ParseResult::Error(ProtocolViolation::UnsupportedOpcode(2)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse(&[0x00]) {
            ParseResult::Error(ProtocolViolation::UnsupportedOpcode(0)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse(&[0x88]) {
            ParseResult::Close => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse(&client_frame(OP_PING, b"p")) {
            ParseResult::Complete(frame, _) => {
                assert_eq!(frame.opcode, Opcode::Ping);
                assert_eq!(frame.payload, b"p");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(Opcode::from(0x3), Opcode::Other(3));
    }

    #[test]
    fn test_mask_remainder() {
        let mut data = *b"abcdefg";
        apply_mask(&mut data, KEY);
        apply_mask(&mut data, KEY);
        assert_eq!(&data, b"abcdefg");

        let mut one = [0u8; 1];
        apply_mask(&mut one, KEY);
        assert_eq!(one, [0x37]);
    }
}
