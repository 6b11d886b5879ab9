//! The connection handshake.
//!
//! A new client's first twelve bytes are read as a fake request (opcode 1,
//! four words). [`ConnectionManager::initial_connection`] learns the byte
//! order from it and stretches the request to cover the authorization name
//! and data, which then come back as opcode 2 for
//! [`ConnectionManager::establish_connection`].

use crate::client::{AuthId, ClientId, SetupState};
use crate::manager::ConnectionManager;
use crate::wire::{
    self, pad4, ByteOrder, CONN_CLIENT_PREFIX, PROTOCOL_MAJOR, PROTOCOL_MINOR, REQ_HEADER,
};
use std::ops::Range;

/// Opcode of the fake request carrying the setup prefix.
pub const SETUP_PREFIX_OPCODE: u8 = 1;
/// Opcode of the fake request carrying prefix plus credentials.
pub const SETUP_AUTH_OPCODE: u8 = 2;

const PREFIX_END: usize = REQ_HEADER + CONN_CLIENT_PREFIX;

struct Prefix {
    major: u16,
    minor: u16,
    name: Range<usize>,
    data: Range<usize>,
}

fn parse_prefix(order: ByteOrder, req: &[u8]) -> Option<Prefix> {
    if req.len() < PREFIX_END {
        return None;
    }
    let p = &req[REQ_HEADER..];
    let name_len = order.read_u16(&p[6..8]) as usize;
    let data_len = order.read_u16(&p[8..10]) as usize;
    let data_start = PREFIX_END + pad4(name_len);
    Some(Prefix {
        major: order.read_u16(&p[2..4]),
        minor: order.read_u16(&p[4..6]),
        name: PREFIX_END..PREFIX_END + name_len,
        data: data_start..data_start + data_len,
    })
}

impl ConnectionManager {
    /// Process the prefix request. Returns `false` when the byte order
    /// marker is invalid and the client must be closed.
    pub fn initial_connection(&mut self, id: ClientId) -> bool {
        {
            let Some(client) = self.client_mut(id) else {
                return false;
            };
            let Some(input) = client.conn.input.as_mut() else {
                return false;
            };
            let req = input.request_mut();
            if req.len() < PREFIX_END {
                return false;
            }
            let Some((order, local)) = ByteOrder::from_prefix(req[REQ_HEADER]) else {
                log::debug!("{}: bad byte order marker {:#04x}", id, req[REQ_HEADER]);
                return false;
            };
            let Some(prefix) = parse_prefix(order, req) else {
                return false;
            };
            let bytes = PREFIX_END + pad4(prefix.name.len()) + pad4(prefix.data.len());
            let Ok(words) = u16::try_from(bytes / 4) else {
                return false;
            };
            req[0] = SETUP_AUTH_OPCODE;
            req[2..4].copy_from_slice(&order.u16_bytes(words));

            client.order = order;
            if !local {
                client.local = false;
            }
            client.req_len = u32::from(words);
            client.state = SetupState::AwaitingAuth;
        }
        self.reset_current_request(id);
        true
    }

    /// Check the version and credentials of a client, then send either the
    /// connection block or a refusal. A refused client is marked for
    /// closing and `false` returned.
    pub fn establish_connection<F>(&mut self, id: ClientId, connection_block: F) -> bool
    where
        F: FnOnce(&Self, ClientId) -> Vec<u8>,
    {
        let Some(order) = self.byte_order(id) else {
            return false;
        };
        let Some(req) = self.request(id).map(<[u8]>::to_vec) else {
            return false;
        };

        let reason = match parse_prefix(order, &req) {
            Some(p) if req.len() != PREFIX_END + pad4(p.name.len()) + pad4(p.data.len()) => {
                Some("Bad length")
            }
            None => Some("Bad length"),
            Some(p) if p.major != PROTOCOL_MAJOR || p.minor != PROTOCOL_MINOR => {
                Some("Protocol version mismatch")
            }
            Some(p) => self
                .client_authorized(id, &req[p.name], &req[p.data])
                .err(),
        };

        if let Some(reason) = reason {
            log::info!("refusing {}: {}", id, reason.trim_end());
            let _ = self.write_to_client(id, &wire::setup_refusal(order, reason));
            self.mark_client_exception(id);
            return false;
        }

        let block = connection_block(self, id);
        if let Some(client) = self.client_mut(id) {
            client.sequence = 0;
            client.state = SetupState::Running;
        }
        let _ = self.write_to_client(id, &block);
        log::debug!("{} connected", id);
        true
    }

    /// Decide whether a client may connect. Connections from trusted
    /// listeners need no credentials; otherwise the authorization schemes
    /// are consulted, then host access. On success the accept timeout no
    /// longer applies to the client.
    pub fn client_authorized(
        &mut self,
        id: ClientId,
        name: &[u8],
        data: &[u8],
    ) -> Result<AuthId, &'static str> {
        let Some(client) = self.client(id) else {
            return Err("Client is not authorized to connect to Server");
        };
        let auth_id = if client.conn.no_auth {
            AuthId::NONE
        } else {
            match self.auth.check(name, data, id) {
                Ok(auth_id) => auth_id,
                Err(reason) => {
                    let peer = client.conn.transport.as_ref().and_then(|t| t.peer_addr());
                    if peer.is_some() && self.hosts.allows(peer) {
                        AuthId::NONE
                    } else {
                        return Err(reason);
                    }
                }
            }
        };
        if let Some(client) = self.client_mut(id) {
            client.conn.auth_id = Some(auth_id);
            client.conn.conn_time = None;
        }
        Ok(auth_id)
    }
}
