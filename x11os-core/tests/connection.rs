use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use x11os_core::{
    wire, ByteOrder, ClientId, ConnectionManager, Dispatcher, EventLoop, HostList, ListenOptions,
    ManualClock, OsConfig, ProtocolError, Request, MIT_MAGIC_COOKIE,
};

const BLOCK: [u8; 8] = [1, 0, 11, 0, 0, 0, 0, 0];
const FLOOD: u8 = 50;
const FLOOD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Default)]
struct Server {
    gone: Vec<ClientId>,
}

impl Dispatcher for Server {
    fn connection_block(&mut self, _os: &ConnectionManager, _client: ClientId) -> Vec<u8> {
        BLOCK.to_vec()
    }

    fn dispatch(
        &mut self,
        os: &mut ConnectionManager,
        client: ClientId,
        request: &Request<'_>,
    ) -> Result<(), ProtocolError> {
        if request.major() == FLOOD {
            let reply: Vec<u8> = (0..FLOOD_BYTES).map(|i| (i % 253) as u8).collect();
            let _ = os.write_to_client(client, &reply);
        }
        Ok(())
    }

    fn client_gone(&mut self, client: ClientId) {
        self.gone.push(client);
    }
}

fn listening(dir: &Path, os: ConnectionManager) -> EventLoop<Server> {
    let mut os = os;
    let opts = ListenOptions {
        unix_dir: Some(dir.to_path_buf()),
        tcp: None,
    };
    os.create_well_known_sockets(0, &opts).unwrap();
    EventLoop::new(os, Server::default())
}

fn pump(ev: &mut EventLoop<Server>, rounds: usize) {
    for _ in 0..rounds {
        ev.run_once(Some(Duration::from_millis(20))).unwrap();
    }
}

fn prefix(name: &[u8], data: &[u8]) -> Vec<u8> {
    let mut p = vec![b'l', 0];
    p.extend_from_slice(&11u16.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&(name.len() as u16).to_le_bytes());
    p.extend_from_slice(&(data.len() as u16).to_le_bytes());
    p.extend_from_slice(&[0, 0]);
    p.extend_from_slice(name);
    p.extend_from_slice(wire::pad_bytes(name.len()));
    p.extend_from_slice(data);
    p.extend_from_slice(wire::pad_bytes(data.len()));
    p
}

fn connect(dir: &Path) -> UnixStream {
    let stream = UnixStream::connect(dir.join("X0")).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

#[test]
fn test_cookie_handshake_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut hosts = HostList::default();
    hosts.set_local(false);
    let mut os = ConnectionManager::new(OsConfig::default()).with_host_access(hosts);
    os.authorization_mut()
        .add(MIT_MAGIC_COOKIE, &[0x11; 16])
        .unwrap();
    let mut ev = listening(dir.path(), os);

    let mut good = connect(dir.path());
    good.write_all(&prefix(MIT_MAGIC_COOKIE.as_bytes(), &[0x11; 16]))
        .unwrap();
    pump(&mut ev, 4);
    let mut block = [0u8; 8];
    good.read_exact(&mut block).unwrap();
    assert_eq!(block, BLOCK);

    let mut bad = connect(dir.path());
    bad.write_all(&prefix(MIT_MAGIC_COOKIE.as_bytes(), &[0x22; 16]))
        .unwrap();
    pump(&mut ev, 4);
    let mut reply = Vec::new();
    bad.read_to_end(&mut reply).unwrap();
    assert_eq!(
        reply,
        wire::setup_refusal(ByteOrder::LittleEndian, "Invalid MIT-MAGIC-COOKIE-1 key")
    );
    assert_eq!(ev.os().client_count(), 1);
    assert_eq!(ev.dispatcher().gone.len(), 1);
}

#[test]
fn test_full_server_refuses_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let os = ConnectionManager::new(OsConfig {
        max_clients: 1,
        ..OsConfig::default()
    });
    let mut ev = listening(dir.path(), os);

    let mut first = connect(dir.path());
    first.write_all(&prefix(b"", b"")).unwrap();
    pump(&mut ev, 4);

    let mut second = connect(dir.path());
    pump(&mut ev, 1);
    second.write_all(&[b'B']).unwrap();
    pump(&mut ev, 2);
    let mut reply = Vec::new();
    second.read_to_end(&mut reply).unwrap();
    assert_eq!(
        reply,
        wire::setup_refusal(ByteOrder::BigEndian, "Maximum number of clients reached")
    );
    assert_eq!(ev.os().client_count(), 1);
}

#[test]
fn test_unfinished_setup_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let os = ConnectionManager::new(OsConfig::default()).with_clock(clock.clone());
    let mut ev = listening(dir.path(), os);

    let mut silent = connect(dir.path());
    pump(&mut ev, 1);
    assert_eq!(ev.os().client_count(), 1);

    clock.advance(Duration::from_secs(61));
    let _late = connect(dir.path());
    pump(&mut ev, 1);
    assert_eq!(ev.dispatcher().gone, vec![ClientId::new(1)]);
    let mut buf = [0u8; 1];
    assert_eq!(silent.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_large_reply_to_slow_reader() {
    let dir = tempfile::tempdir().unwrap();
    let mut ev = listening(dir.path(), ConnectionManager::new(OsConfig::default()));
    let mut peer = connect(dir.path());
    peer.write_all(&prefix(b"", b"")).unwrap();
    pump(&mut ev, 4);
    let mut block = [0u8; 8];
    peer.read_exact(&mut block).unwrap();

    peer.write_all(&[FLOOD, 0, 1, 0]).unwrap();
    pump(&mut ev, 2);
    let id = ev.os().clients().next().unwrap().id();
    // the socket cannot take four megabytes at once
    assert!(ev.os().has_pending_output(id));

    peer.set_nonblocking(true).unwrap();
    let mut got = Vec::new();
    let mut buf = vec![0u8; 8192];
    for _ in 0..10_000 {
        match peer.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => pump(&mut ev, 1),
            Err(e) => panic!("read failed: {}", e),
        }
        if got.len() == FLOOD_BYTES {
            break;
        }
    }
    let expected: Vec<u8> = (0..FLOOD_BYTES).map(|i| (i % 253) as u8).collect();
    assert_eq!(got.len(), expected.len());
    assert!(got == expected);
    assert!(!ev.os().has_pending_output(id));
}
