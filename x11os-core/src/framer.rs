//! Cutting a client's byte stream into requests.
//!
//! Every call first skips the request handed out by the previous call, then
//! works out how many bytes the next request needs from its length field.
//! When they are not all buffered it makes room and performs exactly one
//! nonblocking read. A request declaring more than the configured maximum
//! is reported straight away and its bytes are thrown away as they arrive.

use crate::buffer::InputBuffer;
use crate::transport::Transport;
use crate::wire::{ByteOrder, BIG_REQ_HEADER, REQ_HEADER};
use std::io;

/// Per-client facts the framer needs.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub order: ByteOrder,
    pub big_requests: bool,
    pub max_request_bytes: u64,
    /// Capacity a grown buffer shrinks back to.
    pub buffer_size: usize,
    pub watermark: usize,
}

/// Outcome of one framing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framed {
    /// `len` bytes at the cursor form one request of `words` declared words.
    /// `drained` is set when nothing else is buffered behind it.
    Request { len: usize, words: u32, drained: bool },
    /// The request declares `len` bytes, more than allowed. Whatever of it
    /// is buffered sits at the cursor; the rest will be discarded.
    Oversized { len: u64 },
    /// Read something, but the request is not complete yet.
    Incomplete,
    /// Nothing to read right now.
    WouldBlock,
    /// Threw away part of an oversized request.
    Discarded,
    /// End of stream or a hard error; the client has to go.
    Closed,
}

struct Head {
    needed: u64,
    words: u64,
    known: bool,
    big: bool,
}

impl InputBuffer {
    fn head(&self, limits: &FrameLimits) -> Head {
        let p = self.pending();
        if p.len() < REQ_HEADER {
            return Head {
                needed: REQ_HEADER as u64,
                words: 0,
                known: false,
                big: false,
            };
        }
        let short = limits.order.read_u16(&p[2..4]);
        if short == 0 && limits.big_requests {
            if p.len() < BIG_REQ_HEADER {
                return Head {
                    needed: BIG_REQ_HEADER as u64,
                    words: 0,
                    known: false,
                    big: true,
                };
            }
            let words = u64::from(limits.order.read_u32(&p[4..8]));
            return Head {
                needed: words << 2,
                words,
                known: true,
                big: true,
            };
        }
        Head {
            needed: u64::from(short) << 2,
            words: u64::from(short),
            known: true,
            big: false,
        }
    }

    fn oversized(&mut self, needed: u64) -> Framed {
        let got = (self.available() as u64).min(needed);
        self.ignore_bytes = needed - got;
        self.len_last_req = got as usize;
        Framed::Oversized { len: needed }
    }

    fn read_once(&mut self, transport: Option<&mut (dyn Transport + '_)>) -> Option<Framed> {
        let Some(transport) = transport else {
            return Some(Framed::Closed);
        };
        match self.fill(transport) {
            Ok(0) => Some(Framed::Closed),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(Framed::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Some(Framed::Incomplete),
            Err(e) => {
                log::debug!("read failed: {}", e);
                Some(Framed::Closed)
            }
        }
    }

    /// Throw away buffered bytes of an oversized request, reading first if
    /// nothing is buffered. The buffer is never grown for this.
    fn discard(&mut self, transport: Option<&mut (dyn Transport + '_)>) -> Framed {
        if self.available() == 0 {
            self.compact();
            if let Some(outcome) = self.read_once(transport) {
                return outcome;
            }
        }
        let n = (self.available() as u64).min(self.ignore_bytes) as usize;
        self.advance(n);
        self.ignore_bytes -= n as u64;
        Framed::Discarded
    }

    /// Try to produce the next request. See the module docs.
    pub fn frame(
        &mut self,
        transport: Option<&mut (dyn Transport + '_)>,
        limits: &FrameLimits,
    ) -> Framed {
        self.consume_last();
        if self.ignore_bytes > 0 {
            return self.discard(transport);
        }

        let mut head = self.head(limits);
        if head.needed > limits.max_request_bytes {
            return self.oversized(head.needed);
        }
        if (self.available() as u64) < head.needed {
            let Ok(needed) = usize::try_from(head.needed) else {
                return self.oversized(head.needed);
            };
            if self.available() == 0 || self.start() + needed > self.capacity() {
                self.compact();
                if self.grow(needed).is_err() {
                    log::warn!("cannot grow input buffer to {} bytes", needed);
                    return Framed::Closed;
                }
            }
            if let Some(outcome) = self.read_once(transport) {
                return outcome;
            }
            // give back memory once a huge request has gone through
            if self.capacity() > limits.watermark
                && self.start() + self.available() < limits.buffer_size
                && needed < limits.buffer_size
            {
                self.shrink(limits.buffer_size);
            }
            if !head.known {
                head = self.head(limits);
                if head.needed > limits.max_request_bytes {
                    return self.oversized(head.needed);
                }
            }
            if (self.available() as u64) < head.needed {
                return Framed::Incomplete;
            }
        }

        let mut len = head.needed as usize;
        let mut words = head.words;
        if len == 0 {
            // a zero length with big requests off still occupies its header
            len = REQ_HEADER;
        }
        let drained = self.available() == len;
        self.len_last_req = len;

        if head.big {
            if words < (BIG_REQ_HEADER / 4) as u64 {
                return Framed::Closed;
            }
            // collapse the 8-byte header into a 4-byte one right before the body
            let shift = BIG_REQ_HEADER - REQ_HEADER;
            let p = self.pending();
            let header = [p[0], p[1], p[2], p[3]];
            self.advance(shift);
            self.len_last_req = len - shift;
            self.request_mut()[..REQ_HEADER].copy_from_slice(&header);
            words -= (shift / 4) as u64;
        }

        Framed::Request {
            len: self.len_last_req,
            words: words as u32,
            drained,
        }
    }

    /// Make the last request pending again, restoring a collapsed big
    /// request header. Returns whether the whole request is buffered.
    pub fn reset_request(&mut self, order: ByteOrder, big_requests: bool, words: u32) -> bool {
        self.len_last_req = 0;
        if self.available() < REQ_HEADER {
            return false;
        }
        let p = self.pending();
        let short = order.read_u16(&p[2..4]);
        if short == 0 && big_requests && self.start() >= BIG_REQ_HEADER - REQ_HEADER {
            let header = [p[0], p[1], p[2], p[3]];
            let full = words.saturating_add(1);
            self.rewind(BIG_REQ_HEADER - REQ_HEADER);
            self.len_last_req = BIG_REQ_HEADER;
            let head = self.request_mut();
            head[..REQ_HEADER].copy_from_slice(&header);
            head[REQ_HEADER..].copy_from_slice(&order.u32_bytes(full));
            self.len_last_req = 0;
            return self.available() as u64 >= u64::from(full) << 2;
        }
        self.available() as u64 >= u64::from(short) << 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{self, Step};

    fn limits() -> FrameLimits {
        FrameLimits {
            order: ByteOrder::LittleEndian,
            big_requests: false,
            max_request_bytes: 65535 * 4,
            buffer_size: 16384,
            watermark: 32768,
        }
    }

    /// Opcode, data byte, little-endian length, then filler words.
    fn request(opcode: u8, words: u16) -> Vec<u8> {
        let mut req = vec![opcode, 0];
        req.extend_from_slice(&words.to_le_bytes());
        for i in 4..(words as usize * 4) {
            req.push(i as u8);
        }
        req
    }

    fn frame(buf: &mut InputBuffer, t: &mut mock::MockTransport, limits: &FrameLimits) -> Framed {
        buf.frame(Some(t), limits)
    }

    #[test]
    fn test_twelve_bytes_in_two_reads() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let req = [1u8, 0, 3, 0, 10, 11, 12, 13, 14, 15, 16, 17];
        h.push(&req[..6]);
        h.push(&req[6..]);

        assert_eq!(frame(&mut buf, &mut t, &limits()), Framed::Incomplete);
        assert_eq!(
            frame(&mut buf, &mut t, &limits()),
            Framed::Request { len: 12, words: 3, drained: true }
        );
        assert_eq!(buf.request(), &req);
        assert_eq!(frame(&mut buf, &mut t, &limits()), Framed::WouldBlock);
    }

    #[test]
    fn test_every_split_point() {
        let req = request(42, 5);
        for a in 1..req.len() {
            for b in a..req.len() {
                let (mut t, h) = mock::pair();
                let mut buf = InputBuffer::with_capacity(16384).unwrap();
                h.push(&req[..a]);
                if b > a {
                    h.push(&req[a..b]);
                }
                h.push(&req[b..]);

                let mut got = None;
                for _ in 0..6 {
                    match frame(&mut buf, &mut t, &limits()) {
                        Framed::Request { len, words, .. } => {
                            got = Some((len, words, buf.request().to_vec()));
                            break;
                        }
                        Framed::Incomplete => {}
                        other => panic!("split {}/{}: unexpected {:?}", a, b, other),
                    }
                }
                assert_eq!(got, Some((20, 5, req.clone())), "split {}/{}", a, b);
            }
        }
    }

    #[test]
    fn test_two_requests_back_to_back() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let first = request(7, 2);
        let second = request(9, 3);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        h.push(&stream);

        assert_eq!(
            frame(&mut buf, &mut t, &limits()),
            Framed::Request { len: 8, words: 2, drained: false }
        );
        assert_eq!(buf.request(), &first);
        assert_eq!(
            frame(&mut buf, &mut t, &limits()),
            Framed::Request { len: 12, words: 3, drained: true }
        );
        assert_eq!(buf.request(), &second);
    }

    #[test]
    fn test_big_request_collapsed() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let limits = FrameLimits {
            big_requests: true,
            ..limits()
        };
        // 8 byte header declaring 4 words, then two body words
        let wire = [5u8, 9, 0, 0, 4, 0, 0, 0, 0xa1, 0xa2, 0xa3, 0xa4, 0xb1, 0xb2, 0xb3, 0xb4];
        h.push(&wire);

        assert_eq!(
            buf.frame(Some(&mut t), &limits),
            Framed::Request { len: 12, words: 3, drained: true }
        );
        assert_eq!(
            buf.request(),
            &[5, 9, 0, 0, 0xa1, 0xa2, 0xa3, 0xa4, 0xb1, 0xb2, 0xb3, 0xb4]
        );
    }

    #[test]
    fn test_big_request_in_pieces_large() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(64).unwrap();
        let limits = FrameLimits {
            big_requests: true,
            max_request_bytes: 100_000 * 4,
            buffer_size: 64,
            watermark: 128,
            ..limits()
        };
        let words: u32 = 70_000;
        let mut wire = vec![77u8, 1, 0, 0];
        wire.extend_from_slice(&words.to_le_bytes());
        wire.resize(words as usize * 4, 0x5a);
        for chunk in wire.chunks(4096) {
            h.push(chunk);
        }

        let mut result = Framed::Incomplete;
        for _ in 0..200 {
            result = buf.frame(Some(&mut t), &limits);
            if result != Framed::Incomplete {
                break;
            }
        }
        assert_eq!(
            result,
            Framed::Request { len: 280_000 - 4, words: 69_999, drained: true }
        );
        assert_eq!(&buf.request()[..4], &[77, 1, 0, 0]);
        assert!(buf.request()[4..].iter().all(|&b| b == 0x5a));

        // once the huge request is gone the buffer gives its memory back
        h.push(&request(1, 1));
        assert!(matches!(buf.frame(Some(&mut t), &limits), Framed::Request { len: 4, .. }));
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_big_request_too_short_closes() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let limits = FrameLimits {
            big_requests: true,
            ..limits()
        };
        h.push(&[5, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(buf.frame(Some(&mut t), &limits), Framed::Closed);
    }

    #[test]
    fn test_zero_length_without_big_requests() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        h.push(&[3, 0, 0, 0]);
        assert_eq!(
            frame(&mut buf, &mut t, &limits()),
            Framed::Request { len: 4, words: 0, drained: true }
        );
    }

    #[test]
    fn test_oversized_discarded_without_growing() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(64).unwrap();
        let limits = FrameLimits {
            max_request_bytes: 100 * 4,
            buffer_size: 64,
            watermark: 128,
            ..limits()
        };
        let mut wire = vec![60u8, 0];
        wire.extend_from_slice(&500u16.to_le_bytes());
        wire.resize(2000, 0xee);
        let next = request(8, 2);
        wire.extend_from_slice(&next);
        for chunk in wire.chunks(100) {
            h.push(chunk);
        }

        // reported as soon as the header is in, long before the body
        assert_eq!(buf.frame(Some(&mut t), &limits), Framed::Oversized { len: 2000 });
        assert_eq!(buf.request()[0], 60);
        assert_eq!(buf.request().len(), 64);

        let mut discarded = buf.request().len() as u64;
        let mut seen = None;
        for _ in 0..200 {
            let before = buf.ignore_bytes();
            match buf.frame(Some(&mut t), &limits) {
                Framed::Discarded => discarded += before - buf.ignore_bytes(),
                Framed::Request { len, .. } => {
                    seen = Some((len, buf.request().to_vec()));
                    break;
                }
                Framed::Incomplete => {}
                other => panic!("unexpected {:?}", other),
            }
            assert!(buf.capacity() <= 64);
        }
        assert_eq!(discarded, 2000);
        assert_eq!(seen, Some((8, next)));
    }

    #[test]
    fn test_oversized_reported_once_header_known() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(64).unwrap();
        let limits = FrameLimits {
            max_request_bytes: 100 * 4,
            buffer_size: 64,
            watermark: 128,
            ..limits()
        };
        let mut wire = vec![60u8, 0];
        wire.extend_from_slice(&500u16.to_le_bytes());
        wire.resize(64, 0);
        h.push(&wire);
        assert_eq!(buf.frame(Some(&mut t), &limits), Framed::Oversized { len: 2000 });
        assert_eq!(buf.ignore_bytes(), 2000 - 64);
    }

    #[test]
    fn test_huge_declared_length_does_not_overflow() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let limits = FrameLimits {
            big_requests: true,
            max_request_bytes: u64::from(u32::MAX),
            ..limits()
        };
        h.push(&[1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(
            buf.frame(Some(&mut t), &limits),
            Framed::Oversized { len: u64::from(u32::MAX) << 2 }
        );
    }

    #[test]
    fn test_eof_and_error_close() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        h.push_step(Step::Eof);
        assert_eq!(frame(&mut buf, &mut t, &limits()), Framed::Closed);
        h.push_step(Step::Fail);
        assert_eq!(frame(&mut buf, &mut t, &limits()), Framed::Closed);
        assert_eq!(buf.frame(None, &limits()), Framed::Closed);
    }

    #[test]
    fn test_big_endian_length() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let limits = FrameLimits {
            order: ByteOrder::BigEndian,
            ..limits()
        };
        h.push(&[1, 0, 0, 2, 0, 0, 0, 0]);
        assert_eq!(
            buf.frame(Some(&mut t), &limits),
            Framed::Request { len: 8, words: 2, drained: true }
        );
    }

    #[test]
    fn test_reset_request_replays() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let req = request(4, 2);
        h.push(&req);
        assert!(matches!(frame(&mut buf, &mut t, &limits()), Framed::Request { .. }));
        assert!(buf.reset_request(ByteOrder::LittleEndian, false, 2));
        assert_eq!(
            frame(&mut buf, &mut t, &limits()),
            Framed::Request { len: 8, words: 2, drained: true }
        );
        assert_eq!(buf.request(), &req);
    }

    #[test]
    fn test_reset_request_restores_big_header() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        let limits = FrameLimits {
            big_requests: true,
            ..limits()
        };
        let wire = [5u8, 9, 0, 0, 3, 0, 0, 0, 1, 2, 3, 4];
        h.push(&wire);
        assert!(matches!(
            buf.frame(Some(&mut t), &limits),
            Framed::Request { words: 2, .. }
        ));
        assert!(buf.reset_request(ByteOrder::LittleEndian, true, 2));
        assert_eq!(buf.pending(), &wire);
        assert_eq!(
            buf.frame(Some(&mut t), &limits),
            Framed::Request { len: 8, words: 2, drained: true }
        );
    }

    #[test]
    fn test_prepended_request_comes_first() {
        let (mut t, h) = mock::pair();
        let mut buf = InputBuffer::with_capacity(16384).unwrap();
        h.push(&request(2, 1));
        buf.prepend(&request(1, 1)).unwrap();
        assert!(matches!(frame(&mut buf, &mut t, &limits()), Framed::Request { len: 4, .. }));
        assert_eq!(buf.request()[0], 1);
        assert!(matches!(frame(&mut buf, &mut t, &limits()), Framed::Request { len: 4, .. }));
        assert_eq!(buf.request()[0], 2);
    }
}
