//! Byte streams and listeners the core reads from and writes to.
//!
//! The core never touches sockets directly. Unix-domain and TCP streams
//! implement [`Transport`], their listeners implement [`ListenTransport`],
//! and anything else that can hand out a pollable descriptor can too.

use std::fs;
use std::io::{self, IoSlice, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

pub const X11_UNIX_DIR: &str = "/tmp/.X11-unix";
pub const X11_TCP_BASE: u16 = 6000;

/// Where a connection came from, as far as host access cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Local,
    Inet(IpAddr),
}

/// One accepted connection.
pub trait Transport {
    fn fd(&self) -> RawFd;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn set_nonblocking(&mut self) -> io::Result<()>;
    fn peer_addr(&self) -> Option<PeerAddr>;
    fn is_local(&self) -> bool;
    /// Stop both directions; the descriptor closes when the value drops.
    fn shutdown(&mut self);
}

/// What resetting a listener did to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerReset {
    Unchanged,
    /// The listener now sits on a new descriptor.
    Replaced,
    Failed,
}

/// A listening socket.
pub trait ListenTransport {
    fn fd(&self) -> RawFd;
    fn accept(&mut self) -> io::Result<Box<dyn Transport>>;
    /// Connections from this listener skip authorization.
    fn no_auth(&self) -> bool;
    fn reset(&mut self) -> ListenerReset;
    fn describe(&self) -> String;
}

pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }
}

impl Transport for UnixTransport {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(true)
    }

    fn peer_addr(&self) -> Option<PeerAddr> {
        Some(PeerAddr::Local)
    }

    fn is_local(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        // requests are small and latency bound
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }
}

impl Transport for TcpTransport {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(true)
    }

    fn peer_addr(&self) -> Option<PeerAddr> {
        self.peer.map(|addr| PeerAddr::Inet(addr.ip()))
    }

    fn is_local(&self) -> bool {
        self.peer.is_some_and(|addr| addr.ip().is_loopback())
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Path of the Unix socket for display `n`.
pub fn unix_socket_path(display: u32) -> PathBuf {
    Path::new(X11_UNIX_DIR).join(format!("X{}", display))
}

pub struct UnixListenTransport {
    listener: UnixListener,
    path: PathBuf,
    no_auth: bool,
}

impl UnixListenTransport {
    /// Bind at `path`, replacing a stale socket left by an earlier server.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let listener = bind_unix(&path)?;
        Ok(Self {
            listener,
            path,
            no_auth: false,
        })
    }

    /// Wrap a descriptor inherited from whoever started us.
    ///
    /// # Safety
    ///
    /// `fd` must be an open, listening Unix-domain socket owned by nobody else.
    pub unsafe fn from_raw_fd(fd: RawFd, no_auth: bool) -> io::Result<Self> {
        let listener = UnixListener::from_raw_fd(fd);
        listener.set_nonblocking(true)?;
        let path = listener
            .local_addr()?
            .as_pathname()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self {
            listener,
            path,
            no_auth,
        })
    }

    pub fn with_no_auth(mut self, no_auth: bool) -> Self {
        self.no_auth = no_auth;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            if dir == Path::new(X11_UNIX_DIR) {
                fs::set_permissions(dir, fs::Permissions::from_mode(0o1777))?;
            }
        }
    }
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            fs::remove_file(path)?;
        }
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

impl ListenTransport for UnixListenTransport {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn accept(&mut self) -> io::Result<Box<dyn Transport>> {
        let (stream, _) = self.listener.accept()?;
        Ok(Box::new(UnixTransport::new(stream)))
    }

    fn no_auth(&self) -> bool {
        self.no_auth
    }

    fn reset(&mut self) -> ListenerReset {
        if self.path.as_os_str().is_empty() || self.path.exists() {
            return ListenerReset::Unchanged;
        }
        // somebody removed our socket file, so nobody can reach us there
        match bind_unix(&self.path) {
            Ok(listener) => {
                self.listener = listener;
                ListenerReset::Replaced
            }
            Err(e) => {
                log::warn!("cannot rebind {}: {}", self.path.display(), e);
                ListenerReset::Failed
            }
        }
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

impl Drop for UnixListenTransport {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub struct TcpListenTransport {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpListenTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl ListenTransport for TcpListenTransport {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn accept(&mut self) -> io::Result<Box<dyn Transport>> {
        let (stream, _) = self.listener.accept()?;
        Ok(Box::new(TcpTransport::new(stream)))
    }

    fn no_auth(&self) -> bool {
        false
    }

    fn reset(&mut self) -> ListenerReset {
        ListenerReset::Unchanged
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}
