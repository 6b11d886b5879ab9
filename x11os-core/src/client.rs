//! Per-client state kept by the connection manager.

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::transport::Transport;
use crate::wire::ByteOrder;
use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Index of a client slot. Slot 0 belongs to the server itself and never
/// names a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u32);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);

    pub const fn new(index: u32) -> Self {
        ClientId(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// First resource id this client may allocate.
    pub fn resource_base(self) -> u32 {
        self.0 << 21
    }

    pub fn resource_mask() -> u32 {
        (1 << 21) - 1
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

/// Id returned by an authorization scheme for the credentials a client used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthId(pub u32);

impl AuthId {
    /// Admitted without credentials (trusted listener or host access).
    pub const NONE: AuthId = AuthId(0);
}

/// Where a client is in the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    /// Waiting for the 12-byte prefix carrying byte order and auth sizes.
    AwaitingPrefix,
    /// Waiting for the prefix plus auth name and data.
    AwaitingAuth,
    Running,
}

/// Whether the dispatcher will look at a client.
///
/// Being ignored and being shut out by another client's grab are
/// independent; a client has to leave both before it is served again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serviceability {
    Attending,
    Ignored,
    GrabExcluded,
    IgnoredAndGrabExcluded,
}

impl Serviceability {
    pub fn is_attending(self) -> bool {
        self == Serviceability::Attending
    }
}

/// The transport side of a client.
pub struct Connection {
    pub(crate) fd: RawFd,
    /// `None` once the stream failed and was closed ahead of cleanup.
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) input: Option<InputBuffer>,
    pub(crate) output: Option<OutputBuffer>,
    pub(crate) auth_id: Option<AuthId>,
    /// Set while setup is unfinished; cleared once authorized.
    pub(crate) conn_time: Option<Instant>,
    pub(crate) no_auth: bool,
}

impl Connection {
    pub(crate) fn new(transport: Box<dyn Transport>, now: Instant, no_auth: bool) -> Self {
        Self {
            fd: transport.fd(),
            transport: Some(transport),
            input: None,
            output: None,
            auth_id: None,
            conn_time: Some(now),
            no_auth,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn auth_id(&self) -> Option<AuthId> {
        self.auth_id
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Accepted on a trusted listener; setup skips authorization.
    pub fn no_auth(&self) -> bool {
        self.no_auth
    }
}

pub struct Client {
    pub(crate) id: ClientId,
    pub(crate) conn: Connection,
    pub(crate) order: ByteOrder,
    pub(crate) local: bool,
    pub(crate) big_requests: bool,
    /// Sequence number of the request being dispatched.
    pub(crate) sequence: u16,
    /// Length in words of the request most recently framed.
    pub(crate) req_len: u32,
    pub(crate) ignore_count: u32,
    pub(crate) grab_impervious: bool,
    /// The connection has failed; close it at the next opportunity.
    pub(crate) exception: bool,
    pub(crate) state: SetupState,
}

impl Client {
    pub(crate) fn new(id: ClientId, conn: Connection, local: bool) -> Self {
        Self {
            id,
            conn,
            order: ByteOrder::default(),
            local,
            big_requests: false,
            sequence: 0,
            req_len: 0,
            ignore_count: 0,
            grab_impervious: false,
            exception: false,
            state: SetupState::AwaitingPrefix,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn big_requests(&self) -> bool {
        self.big_requests
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn req_len(&self) -> u32 {
        self.req_len
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn is_grab_impervious(&self) -> bool {
        self.grab_impervious
    }

    pub fn ignore_count(&self) -> u32 {
        self.ignore_count
    }

    pub fn has_exception(&self) -> bool {
        self.exception
    }
}
