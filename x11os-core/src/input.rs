//! Reading requests on behalf of the dispatcher.

use crate::client::{Client, ClientId};
use crate::framer::{FrameLimits, Framed};
use crate::manager::ConnectionManager;

/// What [`ConnectionManager::read_request_from_client`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete request of `len` bytes and `words` declared words is
    /// available through [`ConnectionManager::request`].
    Request { len: usize, words: u32 },
    /// The client sent a request longer than allowed. Answer with a length
    /// error; its bytes are skipped as they arrive.
    Oversized { len: u64 },
    /// Nothing to process yet.
    Pending,
    /// The connection is finished; close the client.
    Closed,
}

impl ConnectionManager {
    fn frame_limits(&self, client: &Client) -> FrameLimits {
        FrameLimits {
            order: client.order,
            big_requests: client.big_requests,
            max_request_bytes: self.config.max_request_bytes(),
            buffer_size: self.pool.buffer_size(),
            watermark: self.pool.watermark(),
        }
    }

    /// An empty buffer left behind by the previous reader goes back to the
    /// pool unless `id` is that reader.
    fn next_available_input(&mut self, id: ClientId) {
        let Some(prev) = self.available_input.take() else {
            return;
        };
        if prev == id {
            return;
        }
        let idle = self
            .clients
            .get_mut(prev.index())
            .and_then(Option::as_mut)
            .filter(|c| c.conn.input.as_ref().is_some_and(|i| i.ignore_bytes() == 0))
            .and_then(|c| c.conn.input.take());
        if let Some(buf) = idle {
            self.pool.release_input(buf);
        }
    }

    /// Frame the next request from a client, reading from its socket at
    /// most once.
    pub fn read_request_from_client(&mut self, id: ClientId) -> ReadOutcome {
        self.next_available_input(id);
        let limits = match self.client(id) {
            Some(client) => self.frame_limits(client),
            None => return ReadOutcome::Closed,
        };

        let framed = {
            let Some(client) = self.clients.get_mut(id.index()).and_then(Option::as_mut) else {
                return ReadOutcome::Closed;
            };
            let conn = &mut client.conn;
            if conn.input.is_none() {
                match self.pool.acquire_input() {
                    Ok(buf) => conn.input = Some(buf),
                    Err(e) => {
                        log::warn!("{}: {}", id, e);
                        self.sched.yield_now = true;
                        return ReadOutcome::Closed;
                    }
                }
            }
            let Some(input) = conn.input.as_mut() else {
                return ReadOutcome::Closed;
            };
            let framed = input.frame(conn.transport.as_deref_mut(), &limits);
            match framed {
                Framed::Request { words, .. } => client.req_len = words,
                Framed::Oversized { len } => {
                    client.req_len = u32::try_from(len / 4).unwrap_or(u32::MAX)
                }
                _ => {}
            }
            framed
        };

        match framed {
            Framed::Request { len, words, drained } => {
                if drained {
                    self.available_input = Some(id);
                }
                ReadOutcome::Request { len, words }
            }
            Framed::Oversized { len } => ReadOutcome::Oversized { len },
            Framed::Incomplete => {
                self.yield_control_no_input(id);
                ReadOutcome::Pending
            }
            Framed::WouldBlock => {
                self.mark_client_not_ready(id);
                self.yield_control_no_input(id);
                ReadOutcome::Pending
            }
            Framed::Discarded => ReadOutcome::Pending,
            Framed::Closed => {
                self.sched.yield_now = true;
                ReadOutcome::Closed
            }
        }
    }

    /// The request handed out by the last successful read.
    pub fn request(&self, id: ClientId) -> Option<&[u8]> {
        self.client(id)?.conn.input.as_ref().map(|i| i.request())
    }

    /// Make `data` the next thing read from the client. The client is
    /// marked ready when that completes a request.
    pub fn insert_fake_request(&mut self, id: ClientId, data: &[u8]) -> bool {
        self.next_available_input(id);
        let complete = {
            let Some(client) = self.clients.get_mut(id.index()).and_then(Option::as_mut) else {
                return false;
            };
            let order = client.order;
            let conn = &mut client.conn;
            if conn.input.is_none() {
                match self.pool.acquire_input() {
                    Ok(buf) => conn.input = Some(buf),
                    Err(_) => return false,
                }
            }
            let Some(input) = conn.input.as_mut() else {
                return false;
            };
            if let Err(e) = input.prepend(data) {
                log::warn!("{}: {}", id, e);
                return false;
            }
            let pending = input.pending();
            pending.len() >= 4 && pending.len() as u64 >= u64::from(order.read_u16(&pending[2..4])) << 2
        };
        if complete {
            self.mark_client_ready(id);
        } else {
            self.yield_control_no_input(id);
        }
        true
    }

    /// Put the current request back so the next read returns it again.
    pub fn reset_current_request(&mut self, id: ClientId) {
        if self.available_input == Some(id) {
            self.available_input = None;
        }
        let complete = {
            let Some(client) = self.clients.get_mut(id.index()).and_then(Option::as_mut) else {
                return;
            };
            let (order, big, words) = (client.order, client.big_requests, client.req_len);
            let Some(input) = client.conn.input.as_mut() else {
                return;
            };
            input.reset_request(order, big, words)
        };
        if complete {
            if self.listen_to_client(id) {
                self.mark_client_ready(id);
            }
            self.yield_control();
        } else {
            self.yield_control_no_input(id);
        }
    }
}
