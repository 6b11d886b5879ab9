//! Per-client input and output buffers and the free lists that recycle them.
//!
//! Idle clients hold no buffers. A client picks one up from the pool when
//! it first reads or first has to queue output, and hands it back once it
//! is drained. Buffers that grew past the watermark while carrying a huge
//! request are dropped instead of recycled so idle memory stays bounded.

use crate::config::OsConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;
use bytes::{Buf, Bytes, BytesMut};
use std::io;

/// Bytes read from one client and not yet consumed.
///
/// `buf[start..end]` holds zero or more whole or partial requests. The
/// request most recently handed out occupies `buf[start..start + len_last_req]`
/// and is skipped at the start of the next read.
#[derive(Debug)]
pub struct InputBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    pub(crate) len_last_req: usize,
    pub(crate) ignore_bytes: u64,
}

impl InputBuffer {
    pub fn with_capacity(size: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::Alloc(size))?;
        buf.resize(size, 0);
        Ok(Self {
            buf,
            start: 0,
            end: 0,
            len_last_req: 0,
            ignore_bytes: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Buffered bytes from the cursor on, including the last request.
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// The request most recently returned by the framer.
    pub fn request(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len_last_req]
    }

    pub(crate) fn request_mut(&mut self) -> &mut [u8] {
        let end = self.start + self.len_last_req;
        &mut self.buf[self.start..end]
    }

    /// Bytes still to be thrown away from an oversized request.
    pub fn ignore_bytes(&self) -> u64 {
        self.ignore_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end && self.ignore_bytes == 0
    }

    pub(crate) fn start(&self) -> usize {
        self.start
    }

    /// Skip the request handed out last time.
    pub(crate) fn consume_last(&mut self) {
        self.start += self.len_last_req;
        self.len_last_req = 0;
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.start += n;
    }

    /// Move the cursor back so `n` bytes in front of it become pending again.
    pub(crate) fn rewind(&mut self, n: usize) {
        debug_assert!(n <= self.start);
        self.start -= n;
    }

    /// Move the unconsumed bytes to the front of the storage.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        if self.start != self.end {
            self.buf.copy_within(self.start..self.end, 0);
        }
        self.end -= self.start;
        self.start = 0;
    }

    /// Grow the storage to `size` bytes, keeping buffered data in place.
    pub fn grow(&mut self, size: usize) -> Result<()> {
        if size <= self.buf.len() {
            return Ok(());
        }
        self.buf
            .try_reserve_exact(size - self.buf.len())
            .map_err(|_| Error::Alloc(size))?;
        self.buf.resize(size, 0);
        Ok(())
    }

    /// Give storage back down to `size`, only possible when everything
    /// buffered lies below it.
    pub fn shrink(&mut self, size: usize) {
        if self.end <= size && size < self.buf.len() {
            self.buf.truncate(size);
            self.buf.shrink_to(size);
        }
    }

    /// Room left behind the filled region.
    pub fn free_tail(&self) -> usize {
        self.buf.len() - self.end
    }

    /// One read from `transport` into the free tail.
    pub(crate) fn fill(&mut self, transport: &mut dyn Transport) -> io::Result<usize> {
        let n = transport.read(&mut self.buf[self.end..])?;
        self.end += n;
        Ok(n)
    }

    /// Put `data` in front of everything pending, as if it had just been
    /// read. The last request is consumed first.
    pub(crate) fn prepend(&mut self, data: &[u8]) -> Result<()> {
        self.consume_last();
        let count = data.len();
        let gotnow = self.available();
        if gotnow + count > self.buf.len() {
            self.grow(gotnow + count)?;
        }
        if count > self.start {
            let moveup = count - self.start;
            if gotnow > 0 {
                self.buf.copy_within(self.start..self.end, self.start + moveup);
            }
            self.start += moveup;
            self.end += moveup;
        }
        self.start -= count;
        self.buf[self.start..self.start + count].copy_from_slice(data);
        Ok(())
    }

    fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.len_last_req = 0;
        self.ignore_bytes = 0;
    }
}

/// Bytes queued for a client whose socket would not take them.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: BytesMut,
    size: usize,
}

impl OutputBuffer {
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Logical capacity used to decide between queueing and flushing.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drop `n` bytes from the front after they reached the socket.
    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Make room for `total` queued bytes with headroom for more, never
    /// beyond `cap`. Returns `false` when `total` exceeds `cap` or the
    /// allocation fails; the buffer is left untouched then.
    pub(crate) fn reserve_total(&mut self, total: usize, headroom: usize, cap: usize) -> bool {
        if total <= self.size {
            return true;
        }
        if total > cap {
            return false;
        }
        let size = total.saturating_add(headroom).min(cap);
        let mut grown = Vec::new();
        if grown.try_reserve_exact(size).is_err() {
            return false;
        }
        grown.extend_from_slice(&self.buf);
        // a uniquely owned Bytes turns back into BytesMut without copying
        self.buf = BytesMut::from(Bytes::from(grown));
        self.size = size;
        true
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Free lists for both buffer kinds.
#[derive(Debug)]
pub struct BufferPool {
    inputs: Vec<InputBuffer>,
    outputs: Vec<OutputBuffer>,
    size: usize,
    watermark: usize,
    limit: usize,
}

impl BufferPool {
    pub fn new(size: usize, watermark: usize, limit: usize) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            size,
            watermark,
            limit,
        }
    }

    pub fn from_config(config: &OsConfig) -> Self {
        Self::new(config.buffer_size, config.buffer_watermark, config.free_buffers)
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn acquire_input(&mut self) -> Result<InputBuffer> {
        match self.inputs.pop() {
            Some(buf) => Ok(buf),
            None => InputBuffer::with_capacity(self.size),
        }
    }

    pub fn release_input(&mut self, mut buf: InputBuffer) {
        if buf.capacity() > self.watermark || self.inputs.len() >= self.limit {
            return;
        }
        buf.clear();
        self.inputs.push(buf);
    }

    pub fn acquire_output(&mut self) -> OutputBuffer {
        self.outputs
            .pop()
            .unwrap_or_else(|| OutputBuffer::with_capacity(self.size))
    }

    pub fn release_output(&mut self, mut buf: OutputBuffer) {
        if buf.size() > self.watermark || self.outputs.len() >= self.limit {
            return;
        }
        buf.clear();
        self.outputs.push(buf);
    }

    /// Free every idle buffer. Used on server reset.
    pub fn reset(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }

    pub fn idle_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn idle_outputs(&self) -> usize {
        self.outputs.len()
    }
}
