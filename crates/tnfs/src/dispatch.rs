//! Request validation and routing.
//!
//! Every received message goes through the same steps: decode the header, check it
//! against the access gate, resolve its session, answer retransmissions from the
//! cache and finally route the command to the filesystem.

use std::{io::Cursor, net::SocketAddr, time::Instant};

use log::{debug, info, warn};

use crate::{
    Result,
    error::{Error, errno::*},
    proto::*,
    serialize::read_request,
    srv::{Filesystem, NO_PAYLOAD, Server},
};

impl<Fs: Filesystem> Server<Fs> {
    /// Handle one received message of at least `HEADER_SIZE` bytes.
    pub(crate) fn dispatch(&mut self, buf: &[u8], peer: SocketAddr, transport: Transport) {
        let Some((mut hdr, payload)) = Header::decode(buf, peer, transport) else {
            warn!("{}: Invalid message received", peer.ip());
            return;
        };
        debug!("{} REQUEST {}", hdr, command_name(hdr.cmd));

        if !self.gate.is_cmd_allowed(hdr.cmd) {
            info!("{} Command {} is not permitted", hdr, command_name(hdr.cmd));
            hdr.status = Status::EPERM;
            self.send(None, &hdr, NO_PAYLOAD);
            return;
        }

        // MOUNT is what establishes a session
        if hdr.cmd == cmd::MOUNT {
            self.mount(&mut hdr, payload);
            return;
        }

        let sid = hdr.sid;
        let session = match self.sessions.find_mut(sid) {
            Some(session) => session,
            None => {
                info!("{} Invalid session ID", hdr);
                hdr.status = Status::BadSession;
                self.send(None, &hdr, NO_PAYLOAD);
                return;
            }
        };
        if session.addr() != peer.ip() {
            warn!("{} Session and IP do not match", hdr);
            return;
        }
        if session.conn().is_some() && session.conn() != transport.conn() {
            warn!("{} Session is assigned to another TCP connection", hdr);
            return;
        }
        session.touch(Instant::now());
        session.bind(transport.conn());

        if session.is_retransmit(hdr.seqno) {
            self.resend(sid, &hdr);
            return;
        }

        let command = match Command::from_byte(hdr.cmd) {
            Some(Command::Session(SessionCmd::Mount)) | None => {
                info!("{} Bad command", hdr);
                hdr.status = Status::ENOSYS;
                self.send(Some(sid), &hdr, NO_PAYLOAD);
                return;
            }
            Some(Command::Session(SessionCmd::Umount)) => {
                self.umount(sid, &mut hdr);
                return;
            }
            Some(command) => command,
        };

        let request = match read_request(command, &mut Cursor::new(payload)) {
            Ok(request) => request,
            Err(e) => {
                info!("{} Malformed {} request: {}", hdr, command.name(), e);
                hdr.status = Status::EINVAL;
                self.send(Some(sid), &hdr, NO_PAYLOAD);
                return;
            }
        };

        if let Request::Open { flags, .. } = request {
            if !self.gate.is_open_allowed(flags) {
                info!("{} Open flags {:?} are not permitted", hdr, flags);
                hdr.status = Status::EPERM;
                self.send(Some(sid), &hdr, NO_PAYLOAD);
                return;
            }
        }

        let res = match self.sessions.find_mut(sid) {
            Some(session) => dispatch_once(&self.fs, &mut session.aux, &request),
            None => return,
        };
        match res {
            Ok(reply) => {
                hdr.status = Status::Success;
                self.send(Some(sid), &hdr, &reply);
            }
            Err(e) => {
                hdr.status = e.status();
                if hdr.status != Status::EOF {
                    debug!("{} {} failed: {}", hdr, command.name(), e);
                }
                self.send(Some(sid), &hdr, NO_PAYLOAD);
            }
        }
    }

    fn mount(&mut self, hdr: &mut Header, payload: &[u8]) {
        let command = Command::Session(SessionCmd::Mount);
        let (version, path, user, password) = match read_request(command, &mut Cursor::new(payload)) {
            Ok(Request::Mount { version, path, user, password }) => (version, path, user, password),
            _ => {
                info!("{} Malformed mount request", hdr);
                hdr.status = Status::EINVAL;
                self.send(None, hdr, &PROTOVERSION);
                return;
            }
        };

        let sid = match self.sessions.create(hdr.peer.ip(), Instant::now(), Default::default()) {
            Ok(sid) => sid,
            Err(e) => {
                warn!("{} Can't allocate session: {}", hdr, e);
                hdr.status = e.status();
                self.send(None, hdr, &PROTOVERSION);
                return;
            }
        };

        let Some(session) = self.sessions.find_mut(sid) else {
            return;
        };
        match self.fs.rmount(&mut session.aux, &path, &user, &password) {
            Ok(()) => {
                session.bind(hdr.transport.conn());
                hdr.sid = sid;
                hdr.status = Status::Success;
                info!(
                    "{} Mounted {} for client version {}.{}, session {:04x}",
                    hdr,
                    path,
                    version >> 8,
                    version & 0xff,
                    sid
                );
                let reply = Reply::Mount {
                    version: PROTOVERSION,
                    min_retry_ms: MIN_RETRY_MS,
                };
                self.send(Some(sid), hdr, &reply);
            }
            Err(e) => {
                info!("{} Mount of {} failed: {}", hdr, path, e);
                self.sessions.destroy(sid);
                hdr.status = e.status();
                self.send(None, hdr, &PROTOVERSION);
            }
        }
    }

    fn umount(&mut self, sid: u16, hdr: &mut Header) {
        if let Some(session) = self.sessions.find_mut(sid) {
            self.fs.rumount(&mut session.aux);
        }
        hdr.status = Status::Success;
        self.send(Some(sid), hdr, NO_PAYLOAD);
        self.sessions.destroy(sid);
        info!("{} Session closed", hdr);
    }
}

#[rustfmt::skip]
fn dispatch_once<Fs: Filesystem>(fs: &Fs, session: &mut Fs::Session, request: &Request) -> Result<Reply> {
    match *request {
        Request::OpenDir { ref path }                                           => fs.ropendir(session, path),
        Request::ReadDir { handle }                                             => fs.rreaddir(session, handle),
        Request::CloseDir { handle }                                            => fs.rclosedir(session, handle),
        Request::MkDir { ref path }                                             => fs.rmkdir(session, path),
        Request::RmDir { ref path }                                             => fs.rrmdir(session, path),
        Request::TellDir { handle }                                             => fs.rtelldir(session, handle),
        Request::SeekDir { handle, pos }                                        => fs.rseekdir(session, handle, pos),
        Request::OpenDirX { options, sort, max_results, ref pattern, ref path } => fs.ropendirx(session, options, sort, max_results, pattern, path),
        Request::ReadDirX { handle, count }                                     => fs.rreaddirx(session, handle, count),
        Request::Open { flags, mode, ref path }                                 => fs.ropen(session, flags, mode, path),
        Request::Read { fd, size }                                              => fs.rread(session, fd, size),
        Request::Write { fd, ref data }                                         => fs.rwrite(session, fd, data),
        Request::Close { fd }                                                   => fs.rclose(session, fd),
        Request::Stat { ref path }                                              => fs.rstat(session, path),
        Request::Seek { fd, whence, offset }                                    => fs.rseek(session, fd, whence, offset),
        Request::Unlink { ref path }                                            => fs.runlink(session, path),
        Request::Chmod { mode, ref path }                                       => fs.rchmod(session, mode, path),
        Request::Rename { ref from, ref to }                                    => fs.rrename(session, from, to),
        Request::OpenOld | Request::Mount { .. } | Request::Umount              => Err(Error::No(ENOSYS)),
    }
}
