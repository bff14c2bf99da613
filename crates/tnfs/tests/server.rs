use std::{
    cell::Cell,
    io::{Read, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    time::{Duration, Instant},
};

use tnfs::{
    Error, OpenFlags, Reply, Result, Stat, cmd,
    errno::*,
    srv::{Config, Filesystem, Server},
};

#[derive(Default)]
struct StubFs {
    calls: Cell<u32>,
    unmounts: Cell<u32>,
}

impl StubFs {
    fn called(&self) {
        self.calls.set(self.calls.get() + 1);
    }
}

impl Filesystem for StubFs {
    // number of reads served
    type Session = u8;

    fn rmount(&self, _: &mut u8, path: &str, _user: &str, _password: &str) -> Result<()> {
        match path {
            "/missing" => Err(Error::No(ENOENT)),
            _ => Ok(()),
        }
    }

    fn rumount(&self, _: &mut u8) {
        self.unmounts.set(self.unmounts.get() + 1);
    }

    fn rmkdir(&self, _: &mut u8, _path: &str) -> Result<Reply> {
        self.called();
        Ok(Reply::Ok)
    }

    fn ropen(&self, _: &mut u8, _flags: OpenFlags, _mode: u16, _path: &str) -> Result<Reply> {
        self.called();
        Ok(Reply::Handle(3))
    }

    fn rread(&self, reads: &mut u8, _fd: u8, size: u16) -> Result<Reply> {
        self.called();
        *reads += 1;
        Ok(Reply::Data(vec![*reads; size as usize]))
    }

    fn rstat(&self, _: &mut u8, _path: &str) -> Result<Reply> {
        self.called();
        Ok(Reply::Stat(Stat::default()))
    }
}

struct Harness {
    server: Server<StubFs>,
    addr: SocketAddr,
}

impl Harness {
    fn new(config: Config) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = Config {
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..config
        };
        let server = Server::bind(StubFs::default(), config).unwrap();
        let addr = server.local_addr().unwrap();
        assert_eq!(server.tcp_addr().unwrap().port(), addr.port());
        Harness { server, addr }
    }

    fn pump(&mut self) {
        for _ in 0..4 {
            self.server.turn(Duration::from_millis(25)).unwrap();
        }
    }

    fn udp_client(&self, ip: &str) -> UdpSocket {
        let sock = UdpSocket::bind((ip, 0)).unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        sock
    }

    fn tcp_client(&mut self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        self.pump();
        stream
    }

    fn call_udp(&mut self, sock: &UdpSocket, frame: &[u8]) -> Option<Vec<u8>> {
        sock.send_to(frame, self.addr).unwrap();
        self.pump();
        let mut buf = [0u8; 1024];
        sock.recv(&mut buf).ok().map(|n| buf[..n].to_vec())
    }

    fn call_tcp(&mut self, stream: &mut TcpStream, frame: &[u8]) -> Option<Vec<u8>> {
        stream.write_all(frame).unwrap();
        self.pump();
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf) {
            Ok(n) if n > 0 => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    fn mount_udp(&mut self, sock: &UdpSocket) -> u16 {
        let resp = self.call_udp(sock, &request(0, 0, cmd::MOUNT, &mount_payload("/"))).unwrap();
        assert_eq!(resp[4], 0);
        sid_of(&resp)
    }
}

fn request(sid: u16, seqno: u8, cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = sid.to_le_bytes().to_vec();
    buf.push(seqno);
    buf.push(cmd);
    buf.extend_from_slice(payload);
    buf
}

fn mount_payload(path: &str) -> Vec<u8> {
    let mut buf = vec![0x02, 0x01];
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b"\0\0\0");
    buf
}

fn open_payload(flags: OpenFlags, path: &str) -> Vec<u8> {
    let mut buf = flags.bits().to_le_bytes().to_vec();
    buf.extend_from_slice(&0o644u16.to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.push(0);
    buf
}

fn sid_of(resp: &[u8]) -> u16 {
    u16::from_le_bytes([resp[0], resp[1]])
}

#[test]
fn mount_and_umount() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");

    let resp = h
        .call_udp(&client, &request(0, 0, cmd::MOUNT, &mount_payload("/")))
        .unwrap();
    let sid = sid_of(&resp);
    assert_ne!(sid, 0);
    assert_eq!(&resp[2..], &[0, cmd::MOUNT, 0x00, 0x02, 0x01, 0xe8, 0x03]);
    assert_eq!(h.server.sessions().len(), 1);

    let resp = h.call_udp(&client, &request(sid, 1, cmd::UMOUNT, &[])).unwrap();
    assert_eq!(resp, request(sid, 1, cmd::UMOUNT, &[0x00]));
    assert_eq!(h.server.filesystem().unmounts.get(), 1);
    assert!(h.server.sessions().is_empty());

    // the session is gone
    let resp = h.call_udp(&client, &request(sid, 2, cmd::READ, &[0, 4, 0])).unwrap();
    assert_eq!(resp, vec![0, 0, 2, cmd::READ, 0xff]);
}

#[test]
fn failed_mount_leaves_no_session() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");

    let resp = h
        .call_udp(&client, &request(0, 9, cmd::MOUNT, &mount_payload("/missing")))
        .unwrap();
    assert_eq!(resp, vec![0, 0, 9, cmd::MOUNT, 0x02, 0x02, 0x01]);
    assert!(h.server.sessions().is_empty());
    assert_eq!(h.server.filesystem().unmounts.get(), 0);
}

#[test]
fn retransmission_is_answered_from_cache() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");
    let sid = h.mount_udp(&client);

    let first = h.call_udp(&client, &request(sid, 1, cmd::READ, &[0, 4, 0])).unwrap();
    assert_eq!(&first[4..], &[0x00, 4, 0, 1, 1, 1, 1]);

    // same sequence number, different payload: the cached reply comes back
    let again = h.call_udp(&client, &request(sid, 1, cmd::READ, &[7, 99, 0])).unwrap();
    assert_eq!(again, first);
    assert_eq!(h.server.filesystem().calls.get(), 1);

    let next = h.call_udp(&client, &request(sid, 2, cmd::READ, &[0, 4, 0])).unwrap();
    assert_eq!(&next[4..], &[0x00, 4, 0, 2, 2, 2, 2]);
    assert_eq!(h.server.filesystem().calls.get(), 2);
}

#[test]
fn unknown_session_is_rejected() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");

    let resp = h
        .call_udp(&client, &request(0x1234, 3, cmd::STAT, b"/x\0"))
        .unwrap();
    assert_eq!(resp, vec![0, 0, 3, cmd::STAT, 0xff]);
    assert_eq!(h.server.filesystem().calls.get(), 0);
}

#[cfg(target_os = "linux")]
#[test]
fn session_of_another_address_is_dropped() {
    let mut h = Harness::new(Config::default());
    let owner = h.udp_client("127.0.0.1");
    let sid = h.mount_udp(&owner);

    let intruder = h.udp_client("127.0.0.2");
    assert!(h.call_udp(&intruder, &request(sid, 1, cmd::STAT, b"/\0")).is_none());
    assert_eq!(h.server.filesystem().calls.get(), 0);
}

#[test]
fn unknown_commands() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");
    let sid = h.mount_udp(&client);

    for (seqno, command) in [(1u8, 0x02u8), (2, 0x19), (3, 0x2a), (4, 0x30), (5, 0xff)] {
        let resp = h.call_udp(&client, &request(sid, seqno, command, &[])).unwrap();
        assert_eq!(resp, request(sid, seqno, command, &[0x16]));
    }
    assert_eq!(h.server.filesystem().calls.get(), 0);
}

#[test]
fn malformed_payload_is_invalid() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");
    let sid = h.mount_udp(&client);

    // path without its terminator
    let resp = h
        .call_udp(&client, &request(sid, 1, cmd::OPEN, &[0x01, 0x00, 0x00, 0x00, b'a']))
        .unwrap();
    assert_eq!(resp, request(sid, 1, cmd::OPEN, &[0x0e]));

    // the retired open command
    let resp = h.call_udp(&client, &request(sid, 2, cmd::OPENFILE_OLD, &[])).unwrap();
    assert_eq!(resp, request(sid, 2, cmd::OPENFILE_OLD, &[0x16]));
    assert_eq!(h.server.filesystem().calls.get(), 0);
}

#[test]
fn short_datagram_is_dropped() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");

    assert!(h.call_udp(&client, &[0x00, 0x00, 0x01]).is_none());
}

#[test]
fn oversized_datagram_is_dropped() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");

    // header, version, path and three terminators: one byte over the limit
    let path = format!("/{}", "a".repeat(523));
    let frame = request(0, 0, cmd::MOUNT, &mount_payload(&path));
    assert_eq!(frame.len(), 533);
    assert!(h.call_udp(&client, &frame).is_none());
    assert!(h.server.sessions().is_empty());

    let path = format!("/{}", "a".repeat(522));
    let frame = request(0, 1, cmd::MOUNT, &mount_payload(&path));
    assert_eq!(frame.len(), 532);
    let resp = h.call_udp(&client, &frame).unwrap();
    assert_eq!(resp.len(), 9);
    assert_eq!(resp[4], 0x00);
    assert_eq!(h.server.sessions().len(), 1);
}

#[test]
fn oversized_response_is_not_sent() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");
    let sid = h.mount_udp(&client);

    // 600 bytes of data can't fit in one message
    let size = 600u16.to_le_bytes();
    assert!(h.call_udp(&client, &request(sid, 1, cmd::READ, &[0, size[0], size[1]])).is_none());
    assert_eq!(h.server.filesystem().calls.get(), 1);
    assert_eq!(h.server.sessions().find(sid).unwrap().last_seqno(), Some(0));

    // nothing was cached, so the next request with that sequence number runs again
    let resp = h.call_udp(&client, &request(sid, 1, cmd::READ, &[0, 4, 0])).unwrap();
    assert_eq!(&resp[4..], &[0x00, 4, 0, 2, 2, 2, 2]);
    assert_eq!(h.server.filesystem().calls.get(), 2);
}

#[test]
fn retransmission_over_tcp() {
    let mut h = Harness::new(Config::default());
    let mut client = h.tcp_client();

    let resp = h
        .call_tcp(&mut client, &request(0, 0, cmd::MOUNT, &mount_payload("/")))
        .unwrap();
    let sid = sid_of(&resp);

    let first = h.call_tcp(&mut client, &request(sid, 1, cmd::READ, &[0, 4, 0])).unwrap();
    let again = h.call_tcp(&mut client, &request(sid, 1, cmd::READ, &[0, 8, 0])).unwrap();
    assert_eq!(again, first);
    assert_eq!(h.server.filesystem().calls.get(), 1);
}

#[test]
fn peer_disconnect_unbinds_session() {
    let mut h = Harness::new(Config::default());
    let mut client = h.tcp_client();

    let resp = h
        .call_tcp(&mut client, &request(0, 0, cmd::MOUNT, &mount_payload("/")))
        .unwrap();
    let sid = sid_of(&resp);
    assert!(h.server.sessions().find(sid).unwrap().conn().is_some());

    drop(client);
    h.pump();

    assert!(h.server.connections().is_empty());
    assert_eq!(h.server.sessions().find(sid).unwrap().conn(), None);
    assert_eq!(h.server.filesystem().unmounts.get(), 0);
}

#[test]
fn read_only_gating() {
    let mut h = Harness::new(Config {
        read_only: true,
        ..Config::default()
    });
    let client = h.udp_client("127.0.0.1");
    let sid = h.mount_udp(&client);

    // denied before the session lookup: no session context in the reply
    let resp = h.call_udp(&client, &request(sid, 1, cmd::MKDIR, b"/d\0")).unwrap();
    assert_eq!(resp, vec![0, 0, 1, cmd::MKDIR, 0x01]);
    for (seqno, command) in [
        (2u8, cmd::RMDIR),
        (3, cmd::WRITE),
        (4, cmd::UNLINK),
        (5, cmd::CHMOD),
        (6, cmd::RENAME),
    ] {
        let resp = h.call_udp(&client, &request(sid, seqno, command, &[])).unwrap();
        assert_eq!(resp, vec![0, 0, seqno, command, 0x01]);
    }

    let creat = open_payload(OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC, "/f");
    let resp = h.call_udp(&client, &request(sid, 7, cmd::OPEN, &creat)).unwrap();
    assert_eq!(resp, request(sid, 7, cmd::OPEN, &[0x01]));
    assert_eq!(h.server.filesystem().calls.get(), 0);

    let rdonly = open_payload(OpenFlags::RDONLY, "/f");
    let resp = h.call_udp(&client, &request(sid, 8, cmd::OPEN, &rdonly)).unwrap();
    assert_eq!(resp, request(sid, 8, cmd::OPEN, &[0x00, 3]));

    let resp = h.call_udp(&client, &request(sid, 9, cmd::STAT, b"/f\0")).unwrap();
    assert_eq!(resp[4], 0x00);
    assert_eq!(h.server.filesystem().calls.get(), 2);
}

#[test]
fn session_is_pinned_to_its_connection() {
    let mut h = Harness::new(Config::default());
    let mut first = h.tcp_client();

    let resp = h
        .call_tcp(&mut first, &request(0, 0, cmd::MOUNT, &mount_payload("/")))
        .unwrap();
    assert_eq!(resp[4], 0x00);
    let sid = sid_of(&resp);
    let bound = h.server.sessions().find(sid).unwrap().conn();
    assert!(bound.is_some());

    let resp = h.call_tcp(&mut first, &request(sid, 1, cmd::READ, &[0, 4, 0])).unwrap();
    assert_eq!(&resp[4..], &[0x00, 4, 0, 1, 1, 1, 1]);

    // another connection, same session
    let mut second = h.tcp_client();
    assert!(h.call_tcp(&mut second, &request(sid, 2, cmd::READ, &[0, 4, 0])).is_none());
    // and plain UDP
    let udp = h.udp_client("127.0.0.1");
    assert!(h.call_udp(&udp, &request(sid, 3, cmd::READ, &[0, 4, 0])).is_none());

    assert_eq!(h.server.sessions().find(sid).unwrap().conn(), bound);
    assert_eq!(h.server.filesystem().calls.get(), 1);
}

#[test]
fn connection_admission() {
    let mut h = Harness::new(Config {
        max_connections: 1,
        ..Config::default()
    });

    let _admitted = h.tcp_client();
    assert_eq!(h.server.connections().len(), 1);

    let mut refused = h.tcp_client();
    let mut frame = [0u8; 9];
    refused.read_exact(&mut frame).unwrap();
    assert_eq!(frame, [0, 0, 0, 0, 0xff, 0x02, 0x01, 0, 0]);

    let mut rest = [0u8; 1];
    assert_eq!(refused.read(&mut rest).unwrap(), 0);
    assert_eq!(h.server.connections().len(), 1);
}

#[test]
fn stale_connection_unbinds_session() {
    let mut h = Harness::new(Config {
        conn_timeout: Duration::from_secs(60),
        ..Config::default()
    });
    let mut client = h.tcp_client();

    let resp = h
        .call_tcp(&mut client, &request(0, 0, cmd::MOUNT, &mount_payload("/")))
        .unwrap();
    let sid = sid_of(&resp);
    assert!(h.server.sessions().find(sid).unwrap().conn().is_some());

    h.server.close_stale(Instant::now() + Duration::from_secs(120));
    assert!(h.server.connections().is_empty());

    let session = h.server.sessions().find(sid).unwrap();
    assert_eq!(session.conn(), None);
    assert_eq!(h.server.filesystem().unmounts.get(), 0);

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn idle_sessions_expire() {
    let mut h = Harness::new(Config {
        session_timeout: Duration::from_secs(60),
        ..Config::default()
    });
    let client = h.udp_client("127.0.0.1");
    h.mount_udp(&client);

    h.server.expire_sessions(Instant::now());
    assert_eq!(h.server.sessions().len(), 1);

    h.server.expire_sessions(Instant::now() + Duration::from_secs(120));
    assert!(h.server.sessions().is_empty());
    assert_eq!(h.server.filesystem().unmounts.get(), 1);
}

#[test]
fn shutdown_frees_everything() {
    let mut h = Harness::new(Config::default());
    let client = h.udp_client("127.0.0.1");
    h.mount_udp(&client);
    let _conn = h.tcp_client();
    assert_eq!(h.server.connections().len(), 1);

    h.server.shutdown();
    assert!(h.server.connections().is_empty());
    assert!(h.server.sessions().is_empty());
    assert_eq!(h.server.filesystem().unmounts.get(), 1);
}
