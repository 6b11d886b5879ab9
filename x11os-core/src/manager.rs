//! The connection manager: listeners, client slots and the readiness wait.
//!
//! Everything the server keeps per process about its connections lives in
//! one [`ConnectionManager`]. Reading and writing requests, fairness and
//! the setup handshake are further `impl` blocks in their own modules.

use crate::access::{HostAccess, HostList};
use crate::auth::Authorization;
use crate::buffer::BufferPool;
use crate::client::{Client, ClientId, Connection};
use crate::clock::{Clock, SystemClock};
use crate::config::OsConfig;
use crate::error::{Error, Result};
use crate::poll::{Interest, Poller, Ready, Trigger};
use crate::schedule::Schedule;
use crate::transport::{
    ListenTransport, ListenerReset, TcpListenTransport, Transport, UnixListenTransport,
    X11_TCP_BASE, X11_UNIX_DIR,
};
use crate::wire::{self, ByteOrder, REQ_HEADER};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, IoSlice};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const NOROOM: &str = "Maximum number of clients reached";

/// Called with the conditions that fired on a descriptor registered
/// through [`ConnectionManager::set_notify_fd`].
pub type NotifyCallback = Box<dyn FnMut(RawFd, Ready)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    Listener,
    Client(ClientId),
    /// A connection refused for lack of slots, waiting for its first byte.
    ConnMax,
    Notify,
}

/// Which well-known sockets to open.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Directory for the Unix socket, `None` to skip it.
    pub unix_dir: Option<PathBuf>,
    /// Address for the TCP listener, `None` to skip it.
    pub tcp: Option<IpAddr>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            unix_dir: Some(PathBuf::from(X11_UNIX_DIR)),
            tcp: None,
        }
    }
}

pub struct ConnectionManager {
    pub(crate) config: OsConfig,
    pub(crate) pool: BufferPool,
    pub(crate) poller: Poller<Handler>,
    /// Indexed by client id; slot 0 stays empty.
    pub(crate) clients: Vec<Option<Client>>,
    listeners: Vec<Box<dyn ListenTransport>>,
    refused: HashMap<RawFd, Box<dyn Transport>>,
    notify: HashMap<RawFd, NotifyCallback>,
    pub(crate) sched: Schedule,
    pub(crate) output_pending: BTreeSet<ClientId>,
    pub(crate) new_output_pending: bool,
    pub(crate) critical_output_pending: bool,
    /// Client whose input buffer is empty and may be handed to another.
    pub(crate) available_input: Option<ClientId>,
    gone: Vec<ClientId>,
    pub(crate) auth: Authorization,
    pub(crate) hosts: Box<dyn HostAccess>,
    clock: Box<dyn Clock>,
    events: Vec<(RawFd, Ready, Handler)>,
}

impl ConnectionManager {
    pub fn new(config: OsConfig) -> Self {
        let mut clients = Vec::new();
        clients.resize_with(config.max_clients + 1, || None);
        Self {
            pool: BufferPool::from_config(&config),
            config,
            poller: Poller::new(),
            clients,
            listeners: Vec::new(),
            refused: HashMap::new(),
            notify: HashMap::new(),
            sched: Schedule::default(),
            output_pending: BTreeSet::new(),
            new_output_pending: false,
            critical_output_pending: false,
            available_input: None,
            gone: Vec::new(),
            auth: Authorization::default(),
            hosts: Box::new(HostList::default()),
            clock: Box::new(SystemClock),
            events: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_host_access(mut self, hosts: impl HostAccess + 'static) -> Self {
        self.hosts = Box::new(hosts);
        self
    }

    pub fn with_authorization(mut self, auth: Authorization) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(&self) -> &OsConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn authorization(&self) -> &Authorization {
        &self.auth
    }

    pub fn authorization_mut(&mut self) -> &mut Authorization {
        &mut self.auth
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().flatten()
    }

    pub fn client_count(&self) -> usize {
        self.clients().count()
    }

    pub fn byte_order(&self, id: ClientId) -> Option<ByteOrder> {
        self.client(id).map(Client::byte_order)
    }

    /// Set by the big-requests extension once a client asked for it.
    pub fn set_big_requests(&mut self, id: ClientId, enabled: bool) {
        if let Some(client) = self.client_mut(id) {
            client.big_requests = enabled;
        }
    }

    /// Count a request just read from the client; returns its sequence number.
    pub(crate) fn bump_sequence(&mut self, id: ClientId) -> u16 {
        match self.client_mut(id) {
            Some(client) => {
                client.sequence = client.sequence.wrapping_add(1);
                client.sequence
            }
            None => 0,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Start accepting on an already listening socket.
    pub fn listen_on_open_fd(&mut self, listener: Box<dyn ListenTransport>) {
        let fd = listener.fd();
        self.poller
            .register(fd, Trigger::Level, Interest::READABLE, Handler::Listener);
        log::info!("listening on {}", listener.describe());
        self.listeners.push(listener);
    }

    /// Open the Unix and TCP sockets for `display`. Failing to open one is
    /// logged; failing to open any is an error.
    pub fn create_well_known_sockets(&mut self, display: u32, opts: &ListenOptions) -> Result<()> {
        let mut created = 0;
        let mut last_error = None;

        if let Some(dir) = &opts.unix_dir {
            let path = dir.join(format!("X{}", display));
            match UnixListenTransport::bind(&path) {
                Ok(listener) => {
                    self.listen_on_open_fd(Box::new(listener));
                    created += 1;
                }
                Err(source) => {
                    log::warn!("cannot listen on {}: {}", path.display(), source);
                    last_error = Some(Error::Listen {
                        addr: path.display().to_string(),
                        source,
                    });
                }
            }
        }

        if let Some(ip) = opts.tcp {
            let port = u16::try_from(display)
                .ok()
                .and_then(|d| X11_TCP_BASE.checked_add(d));
            let bound = match port {
                Some(port) => TcpListenTransport::bind(SocketAddr::new(ip, port)),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "display number out of range for tcp",
                )),
            };
            match bound {
                Ok(listener) => {
                    self.listen_on_open_fd(Box::new(listener));
                    created += 1;
                }
                Err(source) => {
                    log::warn!("cannot listen on tcp {}: {}", ip, source);
                    last_error = Some(Error::Listen {
                        addr: format!("{}:{}", ip, port.unwrap_or_default()),
                        source,
                    });
                }
            }
        }

        if created == 0 {
            return Err(last_error.unwrap_or(Error::NoListeners));
        }
        Ok(())
    }

    /// Give every listener a chance to recover after a server reset.
    /// Listeners that cannot be recovered are dropped.
    pub fn reset_well_known_sockets(&mut self) {
        let mut i = 0;
        while i < self.listeners.len() {
            let old_fd = self.listeners[i].fd();
            match self.listeners[i].reset() {
                ListenerReset::Unchanged => i += 1,
                ListenerReset::Replaced => {
                    self.poller.remove(old_fd);
                    let fd = self.listeners[i].fd();
                    self.poller
                        .register(fd, Trigger::Level, Interest::READABLE, Handler::Listener);
                    i += 1;
                }
                ListenerReset::Failed => {
                    self.poller.remove(old_fd);
                    let listener = self.listeners.remove(i);
                    log::warn!("dropping listener {}", listener.describe());
                }
            }
        }
    }

    /// Server reset: recover the listeners and drop pooled buffers. Client
    /// slots are left as they are.
    pub fn reset(&mut self) {
        self.reset_well_known_sockets();
        self.pool.reset();
    }

    pub fn close_well_known_connections(&mut self) {
        for listener in self.listeners.drain(..) {
            self.poller.remove(listener.fd());
        }
    }

    /// Accept one pending connection on `listener_fd`, after closing
    /// connections that never finished setup.
    pub(crate) fn establish_new_connections(&mut self, listener_fd: RawFd) {
        self.kill_stragglers();

        let Some(listener) = self.listeners.iter_mut().find(|l| l.fd() == listener_fd) else {
            return;
        };
        let no_auth = listener.no_auth();
        let mut transport = match listener.accept() {
            Ok(transport) => transport,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    log::debug!("accept on {} failed: {}", listener.describe(), e);
                }
                return;
            }
        };
        if let Err(e) = transport.set_nonblocking() {
            log::debug!("cannot make fd {} nonblocking: {}", transport.fd(), e);
            return;
        }
        if let Err(transport) = self.alloc_new_connection(transport, no_auth) {
            self.error_conn_max(transport);
        }
    }

    fn kill_stragglers(&mut self) {
        let now = self.clock.now();
        let timeout = self.config.accept_timeout();
        let stale: Vec<ClientId> = self
            .clients()
            .filter(|c| {
                c.exception
                    || c.conn
                        .conn_time
                        .is_some_and(|t| now.saturating_duration_since(t) > timeout)
            })
            .map(Client::id)
            .collect();
        for id in stale {
            log::info!("closing {}: connection setup not finished", id);
            self.close_down_client(id);
        }
    }

    /// Take a slot for `transport` and queue the setup prefix read.
    /// Hands the transport back when no slot is free.
    pub(crate) fn alloc_new_connection(
        &mut self,
        transport: Box<dyn Transport>,
        no_auth: bool,
    ) -> std::result::Result<ClientId, Box<dyn Transport>> {
        let Some(index) = (1..self.clients.len()).find(|&i| self.clients[i].is_none()) else {
            return Err(transport);
        };
        let id = ClientId::new(index as u32);
        let fd = transport.fd();
        let local = transport.is_local();
        let conn = Connection::new(transport, self.clock.now(), no_auth);
        self.clients[index] = Some(Client::new(id, conn, local));
        self.poller.add(fd, Trigger::Edge, Handler::Client(id));
        self.set_poll_client(id);

        // the setup prefix is framed as a request of four words with opcode 1
        let order = ByteOrder::default();
        let mut header = [1u8, 0, 0, 0];
        let words = ((REQ_HEADER + wire::CONN_CLIENT_PREFIX) / 4) as u16;
        header[2..].copy_from_slice(&order.u16_bytes(words));
        if !self.insert_fake_request(id, &header) {
            self.poller.remove(fd);
            self.sched.forget(id);
            let client = self.clients[index].take();
            return match client.and_then(|c| c.conn.transport) {
                Some(transport) => Err(transport),
                None => Ok(id),
            };
        }
        log::debug!("accepted {} on fd {}", id, fd);
        Ok(id)
    }

    /// Serve a connection handed over already open. With `no_auth` set,
    /// setup proceeds without checking credentials.
    pub fn add_client_on_open_fd(
        &mut self,
        mut transport: Box<dyn Transport>,
        no_auth: bool,
    ) -> Option<ClientId> {
        if let Err(e) = transport.set_nonblocking() {
            log::debug!("cannot make fd {} nonblocking: {}", transport.fd(), e);
            return None;
        }
        match self.alloc_new_connection(transport, no_auth) {
            Ok(id) => Some(id),
            Err(mut transport) => {
                transport.shutdown();
                None
            }
        }
    }

    /// No slot for this connection. Wait for its first byte to learn the
    /// byte order, then send the refusal.
    fn error_conn_max(&mut self, transport: Box<dyn Transport>) {
        let fd = transport.fd();
        log::info!("refusing fd {}: {}", fd, NOROOM);
        self.poller
            .register(fd, Trigger::Level, Interest::READABLE, Handler::ConnMax);
        self.refused.insert(fd, transport);
    }

    fn conn_max_notify(&mut self, fd: RawFd) {
        let Some(mut transport) = self.refused.remove(&fd) else {
            return;
        };
        self.poller.remove(fd);
        let mut first = [0u8; 1];
        if let Ok(1) = transport.read(&mut first) {
            if let Some((order, _)) = ByteOrder::from_prefix(first[0]) {
                let reply = wire::setup_refusal(order, NOROOM);
                let _ = transport.writev(&[IoSlice::new(&reply)]);
            }
        }
        transport.shutdown();
    }

    /// Flag a client whose connection broke; it is closed after the
    /// current request or at the next accept.
    pub fn mark_client_exception(&mut self, id: ClientId) {
        if let Some(client) = self.client_mut(id) {
            client.exception = true;
        }
    }

    pub fn client_exception(&self, id: ClientId) -> bool {
        self.client(id).is_some_and(|c| c.exception)
    }

    /// Close every client flagged by [`mark_client_exception`](Self::mark_client_exception).
    pub fn close_failed_clients(&mut self) {
        let failed: Vec<ClientId> = self
            .clients()
            .filter(|c| c.exception)
            .map(Client::id)
            .collect();
        for id in failed {
            self.close_down_client(id);
        }
    }

    /// Drop a client: release a grab it holds, forget its readiness and
    /// close its connection. The id is queued for [`take_gone_clients`](Self::take_gone_clients).
    pub fn close_down_client(&mut self, id: ClientId) {
        if self.client(id).is_none() {
            return;
        }
        if self.sched.grab == Some(id) {
            self.listen_to_all_clients();
        }
        self.sched.forget(id);
        self.close_down_connection(id);
        self.gone.push(id);
    }

    /// Flush what can be flushed, then close the descriptor and give the
    /// buffers back.
    pub fn close_down_connection(&mut self, id: ClientId) {
        let has_output = self
            .client(id)
            .is_some_and(|c| c.conn.is_open() && c.conn.output.as_ref().is_some_and(|o| !o.is_empty()));
        if has_output {
            let _ = self.flush_client(id);
        }
        let Some(client) = self.clients.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        if self.available_input == Some(id) {
            self.available_input = None;
        }
        self.output_pending.remove(&id);

        let conn = client.conn;
        if let Some(mut transport) = conn.transport {
            self.poller.remove(conn.fd);
            transport.shutdown();
        }
        if let Some(input) = conn.input {
            self.pool.release_input(input);
        }
        if let Some(output) = conn.output {
            self.pool.release_output(output);
        }
        log::debug!("closed {}", id);
    }

    /// Clients closed since the last call.
    pub fn take_gone_clients(&mut self) -> Vec<ClientId> {
        std::mem::take(&mut self.gone)
    }

    /// Watch an auxiliary descriptor, level triggered. Registering again
    /// replaces callback and mask at once; an empty mask removes it.
    pub fn set_notify_fd(&mut self, fd: RawFd, mask: Interest, callback: NotifyCallback) {
        if mask.is_empty() {
            self.remove_notify_fd(fd);
            return;
        }
        self.poller
            .register(fd, Trigger::Level, mask, Handler::Notify);
        self.notify.insert(fd, callback);
    }

    /// Change only the mask of a notify descriptor.
    pub fn set_notify_mask(&mut self, fd: RawFd, mask: Interest) {
        if !self.notify.contains_key(&fd) {
            return;
        }
        self.poller.listen(fd, mask);
        self.poller
            .mute(fd, (Interest::READABLE | Interest::WRITABLE).remove(mask));
    }

    pub fn remove_notify_fd(&mut self, fd: RawFd) {
        if self.notify.remove(&fd).is_some() {
            self.poller.remove(fd);
        }
    }

    /// Flush pending output, then block until a descriptor is ready or the
    /// timeout passes, and react to everything that fired. Never blocks
    /// while some client already has input to process.
    pub fn wait_for_something(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.new_output_pending {
            self.flush_all_output();
        }
        let timeout = if self.clients_are_ready() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let waited = self
            .poller
            .wait(timeout, |fd, ready, handler| events.push((fd, ready, *handler)));
        if let Err(e) = waited {
            self.events = events;
            log::error!("poll failed: {}", e);
            return Err(Error::Poll(e));
        }

        for &(fd, ready, handler) in &events {
            // an earlier handler may have closed or replaced this registration
            if self.poller.data(fd) != Some(&handler) {
                continue;
            }
            match handler {
                Handler::Listener => self.establish_new_connections(fd),
                Handler::Client(id) => self.client_ready(id, fd, ready),
                Handler::ConnMax => self.conn_max_notify(fd),
                Handler::Notify => {
                    if let Some(callback) = self.notify.get_mut(&fd) {
                        callback(fd, ready);
                    }
                }
            }
        }
        self.events = events;
        Ok(())
    }

    fn client_ready(&mut self, id: ClientId, fd: RawFd, ready: Ready) {
        if ready.is_error() && !ready.is_readable() {
            self.close_down_client(id);
            return;
        }
        if ready.is_readable() {
            self.mark_client_ready(id);
        }
        if ready.is_writable() {
            self.poller.mute(fd, Interest::WRITABLE);
            self.new_output_pending = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AuthId;
    use crate::clock::ManualClock;
    use crate::transport::mock;
    use std::os::unix::net::UnixStream;

    fn small_config() -> OsConfig {
        OsConfig {
            max_clients: 2,
            ..OsConfig::default()
        }
    }

    #[test]
    fn test_new_client_waits_for_prefix() {
        let mut os = ConnectionManager::new(OsConfig::default());
        let (t, _h) = mock::pair();
        let id = os.add_client_on_open_fd(Box::new(t), true).unwrap();
        assert_eq!(id, ClientId::new(1));
        let client = os.client(id).unwrap();
        assert!(client.connection().conn_time.is_some());
        assert!(!os.is_client_ready(id));
        assert_eq!(os.poller.interest(client.connection().fd()), Some(Interest::READABLE));
    }

    #[test]
    fn test_slots_run_out() {
        let mut os = ConnectionManager::new(small_config());
        for _ in 0..2 {
            let (t, _h) = mock::pair();
            assert!(os.add_client_on_open_fd(Box::new(t), true).is_some());
        }
        let (t, h) = mock::pair();
        assert!(os.add_client_on_open_fd(Box::new(t), true).is_none());
        assert!(h.state().shut);
    }

    #[test]
    fn test_slot_reused_after_close() {
        let mut os = ConnectionManager::new(small_config());
        let (a, ha) = mock::pair();
        let (b, _hb) = mock::pair();
        let first = os.add_client_on_open_fd(Box::new(a), true).unwrap();
        os.add_client_on_open_fd(Box::new(b), true).unwrap();
        os.close_down_client(first);
        assert!(ha.state().shut);
        assert_eq!(os.take_gone_clients(), vec![first]);
        let (c, _hc) = mock::pair();
        assert_eq!(os.add_client_on_open_fd(Box::new(c), true), Some(first));
    }

    #[test]
    fn test_conn_max_refusal_uses_peer_byte_order() {
        let mut os = ConnectionManager::new(small_config());
        let (server, mut peer) = UnixStream::pair().unwrap();
        os.error_conn_max(Box::new(crate::transport::UnixTransport::new(server)));

        use std::io::{Read, Write};
        peer.write_all(b"B").unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();

        let mut reply = Vec::new();
        peer.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, wire::setup_refusal(ByteOrder::BigEndian, NOROOM));
        assert!(os.refused.is_empty());
        assert!(os.poller.is_empty());
    }

    #[test]
    fn test_accept_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let mut os = ConnectionManager::new(OsConfig::default()).with_clock(clock.clone());
        let opts = ListenOptions {
            unix_dir: Some(dir.path().to_path_buf()),
            tcp: None,
        };
        os.create_well_known_sockets(3, &opts).unwrap();
        let path = dir.path().join("X3");

        let _silent = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(os.client_count(), 1);

        clock.advance(Duration::from_secs(59));
        let _second = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(os.client_count(), 2, "not closed before the timeout");

        clock.advance(Duration::from_secs(2));
        let _third = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        // the first one is past 60 seconds, the second is not; the third
        // connection takes the freed slot
        assert_eq!(os.take_gone_clients(), vec![ClientId::new(1)]);
        assert_eq!(os.client_count(), 2);
        assert!(os.client(ClientId::new(2)).is_some());
    }

    #[test]
    fn test_notify_fd_fires_and_is_removed() {
        use std::cell::Cell;
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::rc::Rc;

        let mut os = ConnectionManager::new(OsConfig::default());
        let (mut a, b) = UnixStream::pair().unwrap();
        let fired = Rc::new(Cell::new(0));
        let seen = fired.clone();
        os.set_notify_fd(
            b.as_raw_fd(),
            Interest::READABLE,
            Box::new(move |_, ready| {
                assert!(ready.is_readable());
                seen.set(seen.get() + 1);
            }),
        );
        a.write_all(b"x").unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        os.wait_for_something(Some(Duration::ZERO)).unwrap();
        // level triggered: still readable, fires again
        assert_eq!(fired.get(), 2);

        os.set_notify_fd(b.as_raw_fd(), Interest::NONE, Box::new(|_, _| {}));
        os.wait_for_something(Some(Duration::ZERO)).unwrap();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn test_accept_timeout_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let mut os = ConnectionManager::new(OsConfig::default()).with_clock(clock.clone());
        let opts = ListenOptions {
            unix_dir: Some(dir.path().to_path_buf()),
            tcp: None,
        };
        os.create_well_known_sockets(6, &opts).unwrap();
        let path = dir.path().join("X6");

        let _first = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();

        clock.advance(Duration::from_secs(60));
        let _second = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(os.client_count(), 2, "exactly 60 seconds is not too long");
        assert!(os.take_gone_clients().is_empty());

        clock.advance(Duration::from_millis(1));
        let _third = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(os.take_gone_clients(), vec![ClientId::new(1)]);
        assert_eq!(os.client_count(), 2);
    }

    #[test]
    fn test_trusted_listener_skips_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X0");
        let listener = UnixListenTransport::bind(&path).unwrap().with_no_auth(true);
        let mut hosts = HostList::default();
        hosts.set_local(false);
        let mut os = ConnectionManager::new(OsConfig::default()).with_host_access(hosts);
        os.listen_on_open_fd(Box::new(listener));

        let _peer = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        let id = ClientId::new(1);
        assert!(os.client(id).unwrap().connection().no_auth());
        assert_eq!(os.client_authorized(id, b"", b""), Ok(AuthId::NONE));
    }

    #[test]
    fn test_untrusted_listener_needs_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X0");
        let listener = UnixListenTransport::bind(&path).unwrap();
        let mut hosts = HostList::default();
        hosts.set_local(false);
        let mut os = ConnectionManager::new(OsConfig::default()).with_host_access(hosts);
        os.listen_on_open_fd(Box::new(listener));

        let _peer = UnixStream::connect(&path).unwrap();
        os.wait_for_something(Some(Duration::from_secs(1))).unwrap();
        let id = ClientId::new(1);
        assert!(!os.client(id).unwrap().connection().no_auth());
        assert!(os.client_authorized(id, b"", b"").is_err());
    }

    #[test]
    fn test_notify_mask_mutes_and_restores() {
        use std::cell::Cell;
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::rc::Rc;

        let mut os = ConnectionManager::new(OsConfig::default());
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        let fired = Rc::new(Cell::new(0));
        let seen = fired.clone();
        os.set_notify_fd(
            fd,
            Interest::READABLE,
            Box::new(move |_, _| seen.set(seen.get() + 1)),
        );
        a.write_all(b"x").unwrap();

        os.set_notify_mask(fd, Interest::NONE);
        os.wait_for_something(Some(Duration::ZERO)).unwrap();
        assert_eq!(fired.get(), 0);
        assert_eq!(os.poller.interest(fd), Some(Interest::NONE));

        os.set_notify_mask(fd, Interest::READABLE);
        os.wait_for_something(Some(Duration::ZERO)).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(os.poller.interest(fd), Some(Interest::READABLE));

        // unknown descriptors are left alone
        os.set_notify_mask(a.as_raw_fd(), Interest::READABLE);
        assert!(!os.poller.contains(a.as_raw_fd()));
    }

    #[test]
    fn test_listener_reset_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut os = ConnectionManager::new(OsConfig::default());
        let opts = ListenOptions {
            unix_dir: Some(dir.path().to_path_buf()),
            tcp: None,
        };
        os.create_well_known_sockets(4, &opts).unwrap();
        let path = dir.path().join("X4");
        std::fs::remove_file(&path).unwrap();
        os.reset_well_known_sockets();
        assert!(path.exists());
        assert_eq!(os.listener_count(), 1);
        assert_eq!(os.poller.len(), 1);

        os.close_well_known_connections();
        assert_eq!(os.listener_count(), 0);
        assert!(os.poller.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_no_listeners_is_an_error() {
        let mut os = ConnectionManager::new(OsConfig::default());
        let opts = ListenOptions {
            unix_dir: None,
            tcp: None,
        };
        assert!(matches!(
            os.create_well_known_sockets(0, &opts),
            Err(Error::NoListeners)
        ));
    }
}
