//! Buffered output to clients.
//!
//! Replies are queued in the client's output buffer and go out together
//! when the buffer would overflow, when the dispatcher is done with a
//! client, or when the socket signals it can take more. What the socket
//! refuses stays queued and the descriptor is watched for writability.

use crate::buffer::OutputBuffer;
use crate::client::ClientId;
use crate::error::ClientGone;
use crate::manager::ConnectionManager;
use crate::poll::Interest;
use crate::transport::Transport;
use crate::wire::{pad_bytes, ProtocolError};
use std::io::{self, IoSlice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    /// Everything reached the socket.
    Done,
    /// The socket filled up; the rest is queued in the buffer.
    Queued,
    Failed,
}

/// Write the queued bytes followed by `extra` and its padding. Partial
/// writes are retried until the socket would block. A rest that would
/// push the queue past `cap` fails the client instead of being queued.
pub(crate) fn flush(
    out: &mut OutputBuffer,
    transport: Option<&mut (dyn Transport + '_)>,
    extra: &[u8],
    headroom: usize,
    cap: usize,
) -> Flush {
    let Some(transport) = transport else {
        return Flush::Failed;
    };
    let pad = pad_bytes(extra.len());
    let queued = out.len();
    let mut written = 0;
    let mut not_written = queued + extra.len() + pad.len();
    let mut todo = not_written;

    while todo > 0 {
        let result = {
            let parts = [out.as_slice(), extra, pad];
            let mut iov = [IoSlice::new(&[]); 3];
            let mut n = 0;
            let mut skip = written;
            let mut room = todo;
            for part in parts {
                if room == 0 {
                    break;
                }
                if skip >= part.len() {
                    skip -= part.len();
                    continue;
                }
                let rest = &part[skip..];
                skip = 0;
                let slice = &rest[..rest.len().min(room)];
                room -= slice.len();
                iov[n] = IoSlice::new(slice);
                n += 1;
            }
            transport.writev(&iov[..n])
        };
        match result {
            Ok(0) => break,
            Ok(len) => {
                written += len;
                not_written -= len;
                todo = not_written;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) && todo > 1 => todo >>= 1,
            Err(e) => {
                log::debug!("write to fd {} failed: {}", transport.fd(), e);
                return Flush::Failed;
            }
        }
    }

    if not_written == 0 {
        out.consume(queued);
        return Flush::Done;
    }

    if written < queued {
        out.consume(written);
        if !out.reserve_total(not_written, headroom, cap) {
            log::debug!("fd {}: {} bytes of output over the limit", transport.fd(), not_written);
            return Flush::Failed;
        }
        out.extend(extra);
        out.extend(pad);
    } else {
        let skip = written - queued;
        out.consume(queued);
        if !out.reserve_total(not_written, headroom, cap) {
            log::debug!("fd {}: {} bytes of output over the limit", transport.fd(), not_written);
            return Flush::Failed;
        }
        if skip < extra.len() {
            out.extend(&extra[skip..]);
            out.extend(pad);
        } else {
            out.extend(&pad[skip - extra.len()..]);
        }
    }
    Flush::Queued
}

impl ConnectionManager {
    /// Queue `data` for a client, padded to four bytes. Flushes first when
    /// the queue would overflow. Returns the unpadded length accepted.
    pub fn write_to_client(&mut self, id: ClientId, data: &[u8]) -> Result<usize, ClientGone> {
        if data.is_empty() {
            return Ok(0);
        }
        let Some(client) = self.clients.get_mut(id.index()).and_then(Option::as_mut) else {
            return Err(ClientGone(id));
        };
        if client.exception || !client.conn.is_open() {
            return Err(ClientGone(id));
        }
        let pool = &mut self.pool;
        let out = client
            .conn
            .output
            .get_or_insert_with(|| pool.acquire_output());
        let pad = pad_bytes(data.len());

        if out.len() + data.len() + pad.len() > out.size() {
            self.output_pending.remove(&id);
            if self.output_pending.is_empty() {
                self.critical_output_pending = false;
                self.new_output_pending = false;
            }
            return self.flush_client_with(id, data);
        }

        out.extend(data);
        out.extend(pad);
        self.new_output_pending = true;
        self.output_pending.insert(id);
        Ok(data.len())
    }

    /// Push a client's queued output to its socket.
    pub fn flush_client(&mut self, id: ClientId) -> Result<usize, ClientGone> {
        self.flush_client_with(id, &[])
    }

    fn flush_client_with(&mut self, id: ClientId, extra: &[u8]) -> Result<usize, ClientGone> {
        let headroom = self.pool.buffer_size();
        let cap = self.config.max_output_bytes;
        let Some(client) = self.clients.get_mut(id.index()).and_then(Option::as_mut) else {
            return Err(ClientGone(id));
        };
        let conn = &mut client.conn;
        let fd = conn.fd;
        let Some(out) = conn.output.as_mut() else {
            return Ok(0);
        };

        match flush(out, conn.transport.as_deref_mut(), extra, headroom, cap) {
            Flush::Done => {
                if let Some(out) = conn.output.take() {
                    self.pool.release_output(out);
                }
                self.output_pending.remove(&id);
                Ok(extra.len())
            }
            Flush::Queued => {
                self.output_pending.insert(id);
                self.poller.listen(fd, Interest::WRITABLE);
                Ok(extra.len())
            }
            Flush::Failed => {
                if let Some(mut transport) = conn.transport.take() {
                    self.poller.remove(fd);
                    transport.shutdown();
                }
                conn.output = None;
                client.exception = true;
                self.output_pending.remove(&id);
                if self.available_input == Some(id) {
                    self.available_input = None;
                }
                Err(ClientGone(id))
            }
        }
    }

    /// Flush every client with queued output, except those about to be
    /// serviced again; their output goes out after their requests.
    pub fn flush_all_output(&mut self) {
        if !self.new_output_pending {
            return;
        }
        self.critical_output_pending = false;
        self.new_output_pending = false;

        let pending: Vec<ClientId> = self.output_pending.iter().copied().collect();
        for id in pending {
            if self.client(id).map_or(true, |c| c.exception) {
                continue;
            }
            if self.is_client_ready(id) {
                self.new_output_pending = true;
            } else {
                let _ = self.flush_client(id);
            }
        }
    }

    /// Mark output that should go out before the current client finishes
    /// its time slice, such as input events.
    pub fn set_critical_output_pending(&mut self) {
        self.critical_output_pending = true;
    }

    pub fn critical_output_pending(&self) -> bool {
        self.critical_output_pending
    }

    pub fn flush_if_critical_output_pending(&mut self) {
        if self.critical_output_pending {
            self.flush_all_output();
        }
    }

    /// Queue an error packet for the request currently being processed.
    pub fn send_error_to_client(
        &mut self,
        id: ClientId,
        major: u8,
        err: &ProtocolError,
    ) -> Result<usize, ClientGone> {
        let Some(client) = self.client(id) else {
            return Err(ClientGone(id));
        };
        let pkt = err.encode(client.order, client.sequence, major);
        self.write_to_client(id, &pkt)
    }

    pub fn has_pending_output(&self, id: ClientId) -> bool {
        self.output_pending.contains(&id)
    }
}
