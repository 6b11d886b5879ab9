//! The dispatch loop: wait, then give each ready client a turn.
//!
//! A turn reads and dispatches requests from one client until it runs out
//! of input, something asks it to yield, or its time slice is used up.
//! Requests of clients still in the handshake are handled here; everything
//! else goes to the [`Dispatcher`].

use crate::client::{ClientId, SetupState};
use crate::error::Result;
use crate::input::ReadOutcome;
use crate::manager::ConnectionManager;
use crate::wire::{ProtocolError, REQ_HEADER};
use std::time::Duration;

/// Major opcodes from here on belong to extensions, which carry their
/// minor opcode in the second byte.
const FIRST_EXTENSION_OPCODE: u8 = 128;

/// One request as framed for a client. Big requests arrive with their
/// header collapsed, so the body always starts at byte 4.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    data: &'a [u8],
    words: u32,
    sequence: u16,
}

impl<'a> Request<'a> {
    pub fn new(data: &'a [u8], words: u32, sequence: u16) -> Self {
        Self {
            data,
            words,
            sequence,
        }
    }

    pub fn major(&self) -> u8 {
        self.data[0]
    }

    /// Second header byte: the minor opcode of extension requests, a data
    /// byte for core ones.
    pub fn minor(&self) -> u8 {
        self.data[1]
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn body(&self) -> &'a [u8] {
        &self.data[REQ_HEADER..]
    }

    /// Declared length in words, header included.
    pub fn words(&self) -> u32 {
        self.words
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }
}

/// The protocol side of the server.
pub trait Dispatcher {
    /// Everything sent to a client that passed setup, starting with the
    /// setup prefix.
    fn connection_block(&mut self, os: &ConnectionManager, client: ClientId) -> Vec<u8>;

    /// Execute one request. An error is sent to the client as an error
    /// packet and ends its turn.
    fn dispatch(
        &mut self,
        os: &mut ConnectionManager,
        client: ClientId,
        request: &Request<'_>,
    ) -> std::result::Result<(), ProtocolError>;

    /// Called once for every closed client.
    fn client_gone(&mut self, _client: ClientId) {}
}

pub struct EventLoop<D> {
    os: ConnectionManager,
    dispatcher: D,
    scratch: Vec<u8>,
}

impl<D: Dispatcher> EventLoop<D> {
    pub fn new(os: ConnectionManager, dispatcher: D) -> Self {
        Self {
            os,
            dispatcher,
            scratch: Vec::new(),
        }
    }

    pub fn os(&self) -> &ConnectionManager {
        &self.os
    }

    pub fn os_mut(&mut self) -> &mut ConnectionManager {
        &mut self.os
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Wait at most `timeout` for something to happen, then service every
    /// client that became ready, in round-robin order.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.os.wait_for_something(timeout)?;
        self.os.close_failed_clients();
        self.notify_gone();

        for id in self.os.ready_clients() {
            // an earlier turn may have closed, ignored or parked it
            if !self.os.is_client_ready(id) {
                continue;
            }
            self.service(id);
            self.os.flush_all_output();
            self.notify_gone();
        }
        Ok(())
    }

    /// Run until `stop` returns true. It is checked after every wait.
    pub fn run(&mut self, mut stop: impl FnMut() -> bool) -> Result<()> {
        while !stop() {
            self.run_once(None)?;
        }
        Ok(())
    }

    fn notify_gone(&mut self) {
        for id in self.os.take_gone_clients() {
            self.dispatcher.client_gone(id);
        }
    }

    fn service(&mut self, id: ClientId) {
        self.os.clear_yield();
        self.os.set_last_serviced(id);
        let start = self.os.now();
        let slice = self.os.config().schedule_slice();

        while !self.os.is_it_time_to_yield() {
            self.os.flush_if_critical_output_pending();
            if self.os.now().saturating_duration_since(start) >= slice {
                break;
            }

            let words = match self.os.read_request_from_client(id) {
                ReadOutcome::Pending => break,
                ReadOutcome::Closed => {
                    self.os.close_down_client(id);
                    break;
                }
                ReadOutcome::Oversized { len } => {
                    let sequence = self.os.bump_sequence(id);
                    let major = self.os.request(id).and_then(|r| r.first().copied()).unwrap_or(0);
                    log::debug!("{}: request {} of {} bytes too long", id, sequence, len);
                    let _ = self.os.send_error_to_client(id, major, &ProtocolError::length());
                    break;
                }
                ReadOutcome::Request { words, .. } => words,
            };
            let sequence = self.os.bump_sequence(id);
            let Some(state) = self.os.client(id).map(|c| c.state()) else {
                break;
            };

            match state {
                SetupState::AwaitingPrefix => {
                    if !self.os.initial_connection(id) {
                        self.os.close_down_client(id);
                    }
                    break;
                }
                SetupState::AwaitingAuth => {
                    let dispatcher = &mut self.dispatcher;
                    let admitted = self
                        .os
                        .establish_connection(id, |os, id| dispatcher.connection_block(os, id));
                    if !admitted {
                        self.os.close_down_client(id);
                        break;
                    }
                }
                SetupState::Running => {
                    self.scratch.clear();
                    if let Some(req) = self.os.request(id) {
                        self.scratch.extend_from_slice(req);
                    }
                    let request = Request::new(&self.scratch, words, sequence);
                    let result = if words == 0 {
                        // a zero length is only legal as a big request
                        Err(ProtocolError::length())
                    } else {
                        self.dispatcher.dispatch(&mut self.os, id, &request)
                    };

                    if self.os.client(id).is_none() {
                        break;
                    }
                    if self.os.client_exception(id) {
                        self.os.close_down_client(id);
                        break;
                    }
                    if let Err(err) = result {
                        let major = request.major();
                        let err = if major >= FIRST_EXTENSION_OPCODE && err.minor == 0 {
                            err.with_minor(u16::from(request.minor()))
                        } else {
                            err
                        };
                        log::trace!("{}: error {} for request {}", id, err.code, sequence);
                        let _ = self.os.send_error_to_client(id, major, &err);
                        break;
                    }
                }
            }
        }
    }
}
