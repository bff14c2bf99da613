//! Single-threaded server side TNFS reactor.
//!
//! # Protocol
//! TNFS 1.2 over UDP and TCP

use {
    crate::{
        auth::AccessGate,
        conn::{Connection, ConnectionTable},
        error::{Error, errno::*},
        event::{BackendKind, Multiplexer, new_multiplexer},
        io_err,
        proto::*,
        serialize::{Encodable, Encoder},
        session::{MAX_SESSIONS, SessionRegistry},
        Result,
    },
    bytes::{BufMut, Bytes, BytesMut},
    log::{debug, error, info, warn},
    nix::sys::socket::{setsockopt, sockopt},
    std::{
        io::{self, Read, Write},
        net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
        os::unix::io::{AsFd, AsRawFd, RawFd},
        sync::atomic::{AtomicBool, Ordering},
        time::{Duration, Instant},
    },
};

/// Empty response payload
pub(crate) const NO_PAYLOAD: &[u8] = &[];

/// Filesystem server trait for implementing TNFS servers.
///
/// Every method but [`rmount`](Self::rmount) has a default implementation which
/// answers `ENOSYS`, so an implementation only provides the commands it supports.
///
/// # Error Handling
/// Return `Err(Error::No(errno))` to answer a request with an error status, or
/// `Err(Error::Eof)` at the end of a file or directory. `io::Error`s propagated with
/// `?` are mapped to the closest status code.
///
/// Requests are handled one at a time on the reactor thread; a handler must not
/// block for long.
pub trait Filesystem {
    /// Per-session state, created with `Default` when a client mounts.
    type Session: Default;

    /// Mount `path` into a fresh session.
    ///
    /// On error the session is discarded and the client gets the error status.
    fn rmount(
        &self,
        session: &mut Self::Session,
        path: &str,
        user: &str,
        password: &str,
    ) -> Result<()>;

    /// Release everything a session holds. Called on unmount, on session expiry and
    /// at shutdown.
    fn rumount(&self, _: &mut Self::Session) {}

    /// Open a directory for `rreaddir`, returning `Reply::Handle`.
    fn ropendir(&self, _: &mut Self::Session, _path: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Next entry name of a directory, returning `Reply::Name` or `Error::Eof`.
    fn rreaddir(&self, _: &mut Self::Session, _handle: u8) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rclosedir(&self, _: &mut Self::Session, _handle: u8) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rmkdir(&self, _: &mut Self::Session, _path: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rrmdir(&self, _: &mut Self::Session, _path: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Current position of a directory handle, returning `Reply::Position`.
    fn rtelldir(&self, _: &mut Self::Session, _handle: u8) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rseekdir(&self, _: &mut Self::Session, _handle: u8, _pos: u32) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Open a filtered and sorted directory listing, returning `Reply::DirX`.
    fn ropendirx(
        &self,
        _: &mut Self::Session,
        _options: DirOptions,
        _sort: SortOptions,
        _max_results: u16,
        _pattern: &str,
        _path: &str,
    ) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// A batch of at most `count` entries, returning `Reply::Entries`.
    fn rreaddirx(&self, _: &mut Self::Session, _handle: u8, _count: u8) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Open a file, returning `Reply::Handle`.
    fn ropen(
        &self,
        _: &mut Self::Session,
        _flags: OpenFlags,
        _mode: u16,
        _path: &str,
    ) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Read up to `size` bytes, returning `Reply::Data` or `Error::Eof`.
    fn rread(&self, _: &mut Self::Session, _fd: u8, _size: u16) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Write a block, returning `Reply::Count`.
    fn rwrite(&self, _: &mut Self::Session, _fd: u8, _data: &[u8]) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rclose(&self, _: &mut Self::Session, _fd: u8) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Attributes of a path, returning `Reply::Stat`.
    fn rstat(&self, _: &mut Self::Session, _path: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    /// Reposition a file, returning `Reply::Position`.
    fn rseek(&self, _: &mut Self::Session, _fd: u8, _whence: Whence, _offset: i32) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn runlink(&self, _: &mut Self::Session, _path: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rchmod(&self, _: &mut Self::Session, _mode: u16, _path: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }

    fn rrename(&self, _: &mut Self::Session, _from: &str, _to: &str) -> Result<Reply> {
        Err(Error::No(ENOSYS))
    }
}

/// Server settings
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the UDP and TCP sockets bind to
    pub address: IpAddr,
    /// Port of both sockets; 0 picks an ephemeral port
    pub port: u16,
    pub read_only: bool,
    pub backend: BackendKind,
    /// Capacity of the TCP connection table
    pub max_connections: usize,
    pub max_sessions: usize,
    /// Idle time after which a TCP connection is closed
    pub conn_timeout: Duration,
    /// Idle time after which a session without a TCP connection is destroyed
    pub session_timeout: Duration,
    /// Period of the stats log line, zero disables it
    pub stats_interval: Duration,
    /// Longest time the reactor waits before housekeeping
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: TNFSD_PORT,
            read_only: false,
            backend: BackendKind::default(),
            max_connections: 256,
            max_sessions: MAX_SESSIONS,
            conn_timeout: Duration::from_secs(600),
            session_timeout: Duration::from_secs(6 * 60 * 60),
            stats_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The TNFS reactor.
///
/// Owns the UDP socket, the TCP listener, the connection table and the session
/// registry. Everything runs on the thread calling [`run`](Self::run) or
/// [`turn`](Self::turn).
pub struct Server<Fs: Filesystem> {
    pub(crate) fs: Fs,
    pub(crate) config: Config,
    pub(crate) gate: AccessGate,
    pub(crate) sessions: SessionRegistry<Fs::Session>,
    conns: ConnectionTable,
    udp: UdpSocket,
    listener: TcpListener,
    mux: Box<dyn Multiplexer>,
    last_stats: Instant,
}

fn set_keepalive(listener: &TcpListener) -> nix::Result<()> {
    setsockopt(listener, sockopt::KeepAlive, &true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt(listener, sockopt::TcpKeepIdle, &60)?;
        setsockopt(listener, sockopt::TcpKeepInterval, &10)?;
        setsockopt(listener, sockopt::TcpKeepCount, &5)?;
    }
    Ok(())
}

impl<Fs: Filesystem> Server<Fs> {
    /// Bind the UDP socket and the TCP listener and set up the event backend.
    ///
    /// Both sockets share a port; with port 0 the TCP listener takes the ephemeral
    /// port picked for UDP.
    pub fn bind(fs: Fs, config: Config) -> Result<Server<Fs>> {
        let mut mux = new_multiplexer(config.backend)?;

        let udp = UdpSocket::bind(SocketAddr::new(config.address, config.port))?;
        udp.set_nonblocking(true)?;
        let port = udp.local_addr()?.port();

        let listener = TcpListener::bind(SocketAddr::new(config.address, port))?;
        listener.set_nonblocking(true)?;
        if let Err(e) = set_keepalive(&listener) {
            warn!("Can't enable TCP keep-alive: {}", e);
        }

        if !mux.register(udp.as_fd()) || !mux.register(listener.as_fd()) {
            return Err(From::from(io_err!(
                Other,
                format!("{}: can't register listening sockets", mux.name())
            )));
        }

        Ok(Server {
            gate: AccessGate::new(config.read_only),
            sessions: SessionRegistry::with_capacity(config.max_sessions),
            conns: ConnectionTable::with_capacity(config.max_connections),
            last_stats: Instant::now(),
            fs,
            config,
            udp,
            listener,
            mux,
        })
    }

    /// Address of the UDP socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Address of the TCP listener
    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn filesystem(&self) -> &Fs {
        &self.fs
    }

    pub fn sessions(&self) -> &SessionRegistry<Fs::Session> {
        &self.sessions
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.conns
    }

    /// Serve until `running` turns false, then close every connection and free every
    /// session.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        info!(
            "Listening on {} (udp, tcp) using {}{}",
            self.local_addr()?,
            self.mux.name(),
            if self.gate.is_read_only() { ", read-only" } else { "" }
        );

        let mut res = Ok(());
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.turn(self.config.poll_interval) {
                error!("Event loop failed: {}", e);
                res = Err(e);
                break;
            }
        }

        self.shutdown();
        res
    }

    /// One iteration of the reactor: housekeeping, then wait up to `timeout` and
    /// serve whatever became ready.
    pub fn turn(&mut self, timeout: Duration) -> Result<()> {
        let now = Instant::now();
        self.close_stale(now);
        self.expire_sessions(now);

        let ready = self.mux.wait(timeout);
        if ready.is_error() {
            return Err(From::from(io_err!(
                Other,
                format!("{}: wait failed", self.mux.name())
            )));
        }

        if ready.is_active(self.udp.as_raw_fd()) {
            self.handle_udp();
        }
        if ready.is_active(self.listener.as_raw_fd()) {
            self.accept();
        }
        for fd in self.conns.fds() {
            if ready.is_active(fd) {
                self.handle_tcp(fd);
            }
        }

        self.report_stats(Instant::now());
        Ok(())
    }

    fn handle_udp(&mut self) {
        let mut buf = [0u8; MAXMSGSZ + 1];
        let (n, peer) = match self.udp.recv_from(&mut buf) {
            Ok(res) => res,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                return;
            }
        };

        if n > MAXMSGSZ {
            warn!("{}: Oversized datagram dropped", peer.ip());
        } else if n < HEADER_SIZE {
            warn!("{}: Invalid datagram received", peer.ip());
        } else {
            self.dispatch(&buf[..n], peer, Transport::Udp);
        }
    }

    fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(res) => res,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("Unable to accept TCP connection: {}", e);
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("{}: Can't make connection non-blocking: {}", peer.ip(), e);
            reject(stream, peer);
            return;
        }

        if self.conns.is_full() || !self.mux.register(stream.as_fd()) {
            reject(stream, peer);
            return;
        }

        match self.conns.insert(Connection::new(stream, peer, Instant::now())) {
            Ok(slot) => info!("{}: New TCP connection at index {}", peer.ip(), slot),
            Err(conn) => {
                self.mux.unregister(conn.stream().as_fd());
                reject(conn.into_stream(), peer);
            }
        }
    }

    fn handle_tcp(&mut self, fd: RawFd) {
        let mut buf = [0u8; MAXMSGSZ + 1];
        let now = Instant::now();
        let (res, peer) = match self.conns.get_mut(fd) {
            Some(conn) => {
                conn.touch(now);
                (conn.stream_mut().read(&mut buf), conn.peer())
            }
            None => return,
        };

        match res {
            Ok(0) => {
                info!("{}: Client disconnected, closing socket", peer.ip());
                self.close_conn(fd);
            }
            Ok(n) if n > MAXMSGSZ => warn!("{}: Oversized message dropped", peer.ip()),
            Ok(n) if n < HEADER_SIZE => warn!("{}: Invalid message received", peer.ip()),
            Ok(n) => self.dispatch(&buf[..n], peer, Transport::Tcp(fd)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                info!("{}: Receive failed, closing socket: {}", peer.ip(), e);
                self.close_conn(fd);
            }
        }
    }

    /// Tear down a TCP connection: unbind its sessions, stop watching it and close
    /// it.
    pub(crate) fn close_conn(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.remove(fd) {
            self.sessions.unbind(fd);
            self.mux.unregister(conn.stream().as_fd());
            debug!("{}: Connection closed", conn.peer().ip());
        }
    }

    /// Close the TCP connections idle for longer than the connection timeout.
    ///
    /// Sessions bound to a closed connection survive, unbound.
    pub fn close_stale(&mut self, now: Instant) {
        for fd in self.conns.stale(now, self.config.conn_timeout) {
            if let Some(conn) = self.conns.get(fd) {
                info!("{}: Socket is no longer active; disconnecting", conn.peer().ip());
            }
            self.close_conn(fd);
        }
    }

    /// Destroy the sessions idle for longer than the session timeout.
    pub fn expire_sessions(&mut self, now: Instant) {
        for sid in self.sessions.expired(now, self.config.session_timeout) {
            info!("Session {:04x} timed out", sid);
            self.destroy_session(sid);
        }
    }

    pub(crate) fn destroy_session(&mut self, sid: u16) {
        if let Some(mut session) = self.sessions.destroy(sid) {
            self.fs.rumount(&mut session.aux);
        }
    }

    fn report_stats(&mut self, now: Instant) {
        let interval = self.config.stats_interval;
        if interval.is_zero() || now.saturating_duration_since(self.last_stats) < interval {
            return;
        }
        self.last_stats = now;
        info!(
            "Stats: {} sessions, {} of {} TCP connections",
            self.sessions.len(),
            self.conns.len(),
            self.conns.capacity()
        );
    }

    /// Close every connection and free every session.
    pub fn shutdown(&mut self) {
        for fd in self.conns.fds() {
            self.close_conn(fd);
        }
        for sid in self.sessions.sids() {
            self.destroy_session(sid);
        }
        self.mux.unregister(self.udp.as_fd());
        self.mux.unregister(self.listener.as_fd());
        info!("Server shutdown complete");
    }

    /// Compose a response frame and send it on the transport the request came in.
    ///
    /// With a session the frame is cached on it for retransmission; requests
    /// without a session context are never cached.
    pub(crate) fn send<P: Encodable + ?Sized>(&mut self, sid: Option<u16>, hdr: &Header, payload: &P) {
        let mut writer = BytesMut::with_capacity(MAXMSGSZ).writer();
        let encoded = (Encoder::new(&mut writer)
            << &sid.unwrap_or(0)
            << &hdr.seqno
            << &hdr.cmd
            << &(hdr.status as u8)
            << payload)
            .0
            .map(|_| ());
        if let Err(e) = encoded {
            error!("{}: Can't encode response: {}", hdr, e);
            return;
        }

        let frame = writer.into_inner().freeze();
        if frame.len() > MAXMSGSZ {
            error!("{}: Response of {} bytes is too big", hdr, frame.len());
            return;
        }

        self.transmit(hdr, &frame);
        if let Some(session) = sid.and_then(|sid| self.sessions.find_mut(sid)) {
            session.remember(hdr.seqno, frame);
        }
    }

    /// Send the frame cached on session `sid` again.
    pub(crate) fn resend(&mut self, sid: u16, hdr: &Header) {
        let frame: Bytes = match self.sessions.find(sid) {
            Some(session) => session.last_frame().clone(),
            None => return,
        };
        debug!("{}: Retransmitting {} bytes", hdr, frame.len());
        self.transmit(hdr, &frame);
    }

    fn transmit(&mut self, hdr: &Header, frame: &[u8]) {
        let res = match hdr.transport {
            Transport::Udp => self.udp.send_to(frame, hdr.peer),
            Transport::Tcp(fd) => match self.conns.get_mut(fd) {
                Some(conn) => conn.stream_mut().write(frame),
                None => {
                    warn!("{}: Connection is gone", hdr);
                    return;
                }
            },
        };

        match res {
            Ok(n) if n < frame.len() => warn!("{}: Message was truncated", hdr),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("{}: Message was truncated", hdr)
            }
            Err(e) => {
                warn!("{}: Send failed: {}", hdr, e);
                if let Transport::Tcp(fd) = hdr.transport {
                    self.close_conn(fd);
                }
            }
        }
    }
}

/// Tell a client which can't be admitted that there are too many connections, and
/// close its connection.
fn reject(mut stream: TcpStream, peer: SocketAddr) {
    warn!("{}: Can't accept client; too many connections", peer.ip());

    let mut frame = [0u8; REJECT_FRAME_SIZE];
    frame[4] = Status::BadSession as u8;
    frame[5] = PROTOVERSION_LSB;
    frame[6] = PROTOVERSION_MSB;
    if let Err(e) = stream.write_all(&frame) {
        debug!("{}: Can't send rejection: {}", peer.ip(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_frame_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        // a stream still in blocking mode, as when set_nonblocking failed
        reject(stream, peer);

        let mut frame = Vec::new();
        client.read_to_end(&mut frame).unwrap();
        assert_eq!(frame, [0, 0, 0, 0, 0xff, 0x02, 0x01, 0, 0]);
    }
}
