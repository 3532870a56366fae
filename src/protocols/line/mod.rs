//! Telnet-aware line framing.
//!
//! A line ends at:
//! - `\n`
//! - ASCII EOT (`0x04`, ctrl-D) anywhere
//! - once a telnet IAC (`0xFF`) has been seen, the next byte `<= 0xF0`
//!
//! The last two make ctrl-D and telnet command sequences (e.g. the
//! `IAC IP IAC DO TIMING-MARK` a telnet client sends on ctrl-C) reach the
//! handler immediately instead of waiting for a newline.

use bytes::{Buf, BytesMut};

/// Telnet "Interpret As Command".
pub const IAC: u8 = 0xff;
/// Telnet "Interrupt Process".
pub const IP: u8 = 0xf4;
/// ASCII End Of Transmission.
pub const EOT: u8 = 0x04;

/// Find the end of the first line in `buffer`.
///
/// Returns the index of the boundary byte.
pub fn find_boundary(buffer: &[u8]) -> Option<usize> {
    let mut telnet = false;
    for (i, &c) in buffer.iter().enumerate() {
        if c == IAC {
            telnet = true;
        }
        if c == b'\n' || c == EOT || (telnet && c <= 0xf0) {
            return Some(i);
        }
    }
    None
}

/// Remove the line ending at `boundary` from the buffer.
///
/// A `\n` boundary is dropped; EOT and telnet bytes are kept so the handler
/// can act on them. One trailing `\r` is stripped.
pub fn take_line(buffer: &mut BytesMut, boundary: usize) -> Vec<u8> {
    let end = if buffer[boundary] == b'\n' {
        boundary
    } else {
        boundary + 1
    };
    let mut line = buffer[..end].to_vec();
    buffer.advance(boundary + 1);
    strip_cr(&mut line);
    line
}

/// Drain whatever is left at end of stream.
///
/// Returns `None` if nothing but (at most) a carriage return remains.
pub fn take_remainder(buffer: &mut BytesMut) -> Option<Vec<u8>> {
    let mut line = buffer.split().to_vec();
    strip_cr(&mut line);
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

fn strip_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(input: &[u8]) -> (Vec<Vec<u8>>, BytesMut) {
        let mut buffer = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(end) = find_boundary(&buffer) {
            lines.push(take_line(&mut buffer, end));
        }
        (lines, buffer)
    }

    #[test]
    fn test_newline_lines() {
        let (lines, rest) = drain(b"one\r\ntwo\nthree\r\n\n");
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec(), vec![]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let (lines, rest) = drain(b"done\npart");
        assert_eq!(lines, vec![b"done".to_vec()]);
        assert_eq!(&rest[..], b"part");
    }

    #[test]
    fn test_eot_is_a_boundary() {
        let (lines, rest) = drain(b"abc\x04def");
        assert_eq!(lines, vec![b"abc\x04".to_vec()]);
        assert_eq!(&rest[..], b"def");
    }

    #[test]
    fn test_telnet_interrupt_forwarded_early() {
        // ctrl-C from a telnet client: IAC IP IAC DO TIMING-MARK
        let (lines, rest) = drain(&[b'x', IAC, IP, IAC, 0xfd, 0x06, b'y', b'\n']);
        assert_eq!(lines, vec![vec![b'x', IAC, IP, IAC, 0xfd, 0x06], b"y".to_vec()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_telnet_mode_needs_iac() {
        // Bytes <= 0xF0 are ordinary data until an IAC shows up.
        assert_eq!(find_boundary(b"hello"), None);
        assert_eq!(find_boundary(&[IAC, 0xfb, 0x01]), Some(2));
        assert_eq!(find_boundary(&[IAC, 0xfb]), None);
    }

    #[test]
    fn test_remainder() {
        let mut buffer = BytesMut::from(&b"tail\r"[..]);
        assert_eq!(take_remainder(&mut buffer), Some(b"tail".to_vec()));
        assert!(buffer.is_empty());

        let mut buffer = BytesMut::from(&b"\r"[..]);
        assert_eq!(take_remainder(&mut buffer), None);

        let mut buffer = BytesMut::new();
        assert_eq!(take_remainder(&mut buffer), None);
    }
}
