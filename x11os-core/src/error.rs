//! Error types for the connection core.
//!
//! Only failures that stop the server surface here. Anything that ends a
//! single client is reported through the outcome of the operation instead.

use crate::client::ClientId;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The readiness wait failed with something other than an interrupt.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("cannot allocate {0} byte buffer")]
    Alloc(usize),

    #[error("failed to establish listening socket {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no listening sockets established")]
    NoListeners,

    #[error("invalid authority file: {0}")]
    Authority(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The client's connection failed or is already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} is gone")]
pub struct ClientGone(pub ClientId);
