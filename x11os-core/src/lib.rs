//! x11os-core - connection layer of an X11 server
//!
//! Accepts clients, frames their byte streams into requests, buffers
//! replies and decides whose turn it is. Protocol semantics live behind
//! the [`Dispatcher`] trait.

mod access;
mod auth;
mod buffer;
mod client;
mod clock;
mod config;
mod dispatch;
mod error;
mod framer;
mod input;
mod manager;
mod output;
mod poll;
mod schedule;
mod setup;
mod transport;
pub mod wire;

pub use access::{HostAccess, HostList};
pub use auth::{
    AuthScheme, Authorization, AuthorityEntry, MitMagicCookie, FAMILY_INTERNET, FAMILY_LOCAL,
    FAMILY_WILD, MIT_MAGIC_COOKIE,
};
pub use buffer::{BufferPool, InputBuffer, OutputBuffer};
pub use client::{AuthId, Client, ClientId, Connection, Serviceability, SetupState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OsConfig, BUFSIZE, BUFWATERMARK, MAX_BIG_REQUEST_WORDS, MAX_OUTPUT_BYTES};
pub use dispatch::{Dispatcher, EventLoop, Request};
pub use error::{ClientGone, Error, Result};
pub use framer::{FrameLimits, Framed};
pub use input::ReadOutcome;
pub use manager::{ConnectionManager, ListenOptions, NotifyCallback};
pub use poll::{Interest, Poller, Ready, Trigger};
pub use setup::{SETUP_AUTH_OPCODE, SETUP_PREFIX_OPCODE};
pub use transport::{
    unix_socket_path, ListenTransport, ListenerReset, PeerAddr, TcpListenTransport, TcpTransport,
    Transport, UnixListenTransport, UnixTransport, X11_TCP_BASE, X11_UNIX_DIR,
};
pub use wire::{ByteOrder, ProtocolError};
