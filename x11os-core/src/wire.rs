//! Byte order, padding and fixed packets of the X11 wire format.

use x11rb_protocol::protocol::xproto;

/// Size of the common request header (opcode, data, 16-bit length).
pub const REQ_HEADER: usize = 4;
/// Size of the big-request header (16-bit length zero, 32-bit length follows).
pub const BIG_REQ_HEADER: usize = 8;
/// Size of the client setup prefix that follows the synthetic setup request.
pub const CONN_CLIENT_PREFIX: usize = 12;
/// Size of the server's setup reply prefix.
pub const CONN_SETUP_PREFIX: usize = 8;
/// Every error packet is 32 bytes.
pub const ERROR_PACKET: usize = 32;

pub const PROTOCOL_MAJOR: u16 = 11;
pub const PROTOCOL_MINOR: u16 = 0;

const PAD: [u8; 3] = [0; 3];

/// Byte order a client announced in its setup prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Parse the first byte of a setup prefix.
    ///
    /// `l` and `B` are the usual markers; `r` and `R` are the same orders
    /// sent by a peer that must not be treated as local. The flag returned
    /// alongside is `false` for those.
    pub fn from_prefix(byte: u8) -> Option<(Self, bool)> {
        match byte {
            b'l' => Some((ByteOrder::LittleEndian, true)),
            b'B' => Some((ByteOrder::BigEndian, true)),
            b'r' => Some((ByteOrder::LittleEndian, false)),
            b'R' => Some((ByteOrder::BigEndian, false)),
            _ => None,
        }
    }

    pub fn read_u16(self, b: &[u8]) -> u16 {
        let raw = [b[0], b[1]];
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
        }
    }

    pub fn read_u32(self, b: &[u8]) -> u32 {
        let raw = [b[0], b[1], b[2], b[3]];
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
        }
    }

    pub fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            ByteOrder::LittleEndian => v.to_le_bytes(),
            ByteOrder::BigEndian => v.to_be_bytes(),
        }
    }

    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::LittleEndian => v.to_le_bytes(),
            ByteOrder::BigEndian => v.to_be_bytes(),
        }
    }
}

/// Bytes needed to bring `n` up to a multiple of four.
pub fn padding(n: usize) -> usize {
    (4 - (n & 3)) & 3
}

/// `n` rounded up to a multiple of four.
pub fn pad4(n: usize) -> usize {
    n + padding(n)
}

/// Zero bytes used to pad a write of `n` bytes.
pub fn pad_bytes(n: usize) -> &'static [u8] {
    &PAD[..padding(n)]
}

/// Setup-failed reply: prefix with `success = 0`, the reason, then padding.
pub fn setup_refusal(order: ByteOrder, reason: &str) -> Vec<u8> {
    // the reason length travels in a single byte
    let reason = &reason.as_bytes()[..reason.len().min(u8::MAX as usize)];
    let words = pad4(reason.len()) / 4;

    let mut reply = Vec::with_capacity(CONN_SETUP_PREFIX + pad4(reason.len()));
    reply.push(0); // failed
    reply.push(reason.len() as u8);
    reply.extend_from_slice(&order.u16_bytes(PROTOCOL_MAJOR));
    reply.extend_from_slice(&order.u16_bytes(PROTOCOL_MINOR));
    reply.extend_from_slice(&order.u16_bytes(words as u16));
    reply.extend_from_slice(reason);
    reply.extend_from_slice(pad_bytes(reason.len()));
    reply
}

/// An error a request produced, sent back as a 32-byte error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: u8,
    pub bad_value: u32,
    pub minor: u16,
}

impl ProtocolError {
    pub fn new(code: u8) -> Self {
        Self {
            code,
            bad_value: 0,
            minor: 0,
        }
    }

    pub fn request() -> Self {
        Self::new(xproto::REQUEST_ERROR)
    }

    pub fn length() -> Self {
        Self::new(xproto::LENGTH_ERROR)
    }

    pub fn with_value(mut self, bad_value: u32) -> Self {
        self.bad_value = bad_value;
        self
    }

    pub fn with_minor(mut self, minor: u16) -> Self {
        self.minor = minor;
        self
    }

    /// Encode for a client in `order`, for the request `major` that carried
    /// sequence number `sequence`.
    pub fn encode(&self, order: ByteOrder, sequence: u16, major: u8) -> [u8; ERROR_PACKET] {
        let mut pkt = [0u8; ERROR_PACKET];
        pkt[0] = 0; // error
        pkt[1] = self.code;
        pkt[2..4].copy_from_slice(&order.u16_bytes(sequence));
        pkt[4..8].copy_from_slice(&order.u32_bytes(self.bad_value));
        pkt[8..10].copy_from_slice(&order.u16_bytes(self.minor));
        pkt[10] = major;
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_byte_order() {
        assert_eq!(ByteOrder::from_prefix(b'l'), Some((ByteOrder::LittleEndian, true)));
        assert_eq!(ByteOrder::from_prefix(b'B'), Some((ByteOrder::BigEndian, true)));
        assert_eq!(ByteOrder::from_prefix(b'r'), Some((ByteOrder::LittleEndian, false)));
        assert_eq!(ByteOrder::from_prefix(b'R'), Some((ByteOrder::BigEndian, false)));
        assert_eq!(ByteOrder::from_prefix(b'x'), None);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 3);
        assert_eq!(padding(6), 2);
        assert_eq!(pad4(33), 36);
        assert_eq!(pad_bytes(5), &[0, 0, 0]);
    }

    #[test]
    fn test_refusal_big_endian() {
        let reply = setup_refusal(ByteOrder::BigEndian, "Maximum number of clients reached");
        assert_eq!(reply.len(), 8 + 36);
        assert_eq!(reply[0], 0);
        assert_eq!(reply[1], 33);
        assert_eq!(&reply[2..4], &[0, 11]);
        assert_eq!(&reply[4..6], &[0, 0]);
        assert_eq!(&reply[6..8], &[0, 9]);
        assert_eq!(&reply[8..41], b"Maximum number of clients reached");
        assert_eq!(&reply[41..], &[0, 0, 0]);
    }

    #[test]
    fn test_error_packet() {
        let pkt = ProtocolError::length()
            .with_value(0xdead)
            .encode(ByteOrder::LittleEndian, 7, 98);
        assert_eq!(pkt[0], 0);
        assert_eq!(pkt[1], 16);
        assert_eq!(&pkt[2..4], &[7, 0]);
        assert_eq!(&pkt[4..8], &[0xad, 0xde, 0, 0]);
        assert_eq!(pkt[10], 98);
        assert!(pkt[11..].iter().all(|&b| b == 0));
    }
}
