//! Client sessions and their retransmission state.

use std::{
    collections::HashMap,
    net::IpAddr,
    os::unix::io::RawFd,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{Result, errno::*, error::Error};

/// Default number of concurrently mounted sessions
pub const MAX_SESSIONS: usize = 4096;

/// Server side record of a mounted client.
///
/// `T` is the filesystem's per-session state (mount root, open handles, ...).
#[derive(Debug)]
pub struct Session<T> {
    sid: u16,
    addr: IpAddr,
    conn: Option<RawFd>,
    last_contact: Instant,
    last_seqno: Option<u8>,
    last_frame: Bytes,
    pub aux: T,
}

impl<T> Session<T> {
    pub fn sid(&self) -> u16 {
        self.sid
    }

    /// Address of the client which mounted the session
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The TCP connection this session is pinned to, if any
    pub fn conn(&self) -> Option<RawFd> {
        self.conn
    }

    pub fn bind(&mut self, conn: Option<RawFd>) {
        self.conn = conn;
    }

    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    pub fn last_seqno(&self) -> Option<u8> {
        self.last_seqno
    }

    /// The frame most recently sent on behalf of this session
    pub fn last_frame(&self) -> &Bytes {
        &self.last_frame
    }

    /// True if `seqno` repeats the sequence number of the last answered request
    pub fn is_retransmit(&self, seqno: u8) -> bool {
        self.last_seqno == Some(seqno)
    }

    /// Cache a sent frame for retransmission
    pub fn remember(&mut self, seqno: u8, frame: Bytes) {
        self.last_seqno = Some(seqno);
        self.last_frame = frame;
    }
}

/// Live sessions, keyed by session ID.
#[derive(Debug)]
pub struct SessionRegistry<T> {
    sessions: HashMap<u16, Session<T>>,
    capacity: usize,
    next_sid: u16,
}

impl<T> SessionRegistry<T> {
    pub fn with_capacity(capacity: usize) -> SessionRegistry<T> {
        SessionRegistry {
            sessions: HashMap::new(),
            capacity,
            next_sid: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session owned by `addr` and return its ID.
    ///
    /// Session IDs are nonzero and unique among live sessions. Fails with `ENOMEM`
    /// once the registry holds `capacity` sessions.
    pub fn create(&mut self, addr: IpAddr, now: Instant, aux: T) -> Result<u16> {
        if self.sessions.len() >= self.capacity || self.sessions.len() >= u16::MAX as usize {
            return Err(Error::No(ENOMEM));
        }

        let mut sid = self.next_sid;
        while sid == 0 || self.sessions.contains_key(&sid) {
            sid = sid.wrapping_add(1);
        }
        self.next_sid = sid.wrapping_add(1);

        self.sessions.insert(
            sid,
            Session {
                sid,
                addr,
                conn: None,
                last_contact: now,
                last_seqno: None,
                last_frame: Bytes::new(),
                aux,
            },
        );
        Ok(sid)
    }

    pub fn find(&self, sid: u16) -> Option<&Session<T>> {
        self.sessions.get(&sid)
    }

    pub fn find_mut(&mut self, sid: u16) -> Option<&mut Session<T>> {
        self.sessions.get_mut(&sid)
    }

    pub fn destroy(&mut self, sid: u16) -> Option<Session<T>> {
        self.sessions.remove(&sid)
    }

    /// Reset every session pinned to connection `fd` to "no connection".
    ///
    /// Returns the number of sessions unbound.
    pub fn unbind(&mut self, fd: RawFd) -> usize {
        let mut n = 0;
        for session in self.sessions.values_mut().filter(|s| s.conn == Some(fd)) {
            session.conn = None;
            n += 1;
        }
        n
    }

    /// IDs of the sessions idle for longer than `timeout` and not bound to a
    /// connection
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<u16> {
        self.sessions
            .values()
            .filter(|s| s.conn.is_none())
            .filter(|s| now.saturating_duration_since(s.last_contact) > timeout)
            .map(Session::sid)
            .collect()
    }

    pub fn sids(&self) -> Vec<u16> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session<T>> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn session_ids_are_unique_and_nonzero() {
        let mut reg = SessionRegistry::with_capacity(8);
        let now = Instant::now();
        let a = reg.create(localhost(), now, ()).unwrap();
        let b = reg.create(localhost(), now, ()).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);

        assert!(reg.destroy(a).is_some());
        assert!(reg.find(a).is_none());
        assert!(reg.find(b).is_some());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = SessionRegistry::with_capacity(1);
        let now = Instant::now();
        reg.create(localhost(), now, ()).unwrap();
        match reg.create(localhost(), now, ()) {
            Err(Error::No(ENOMEM)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn ids_wrap_around_live_sessions() {
        let mut reg = SessionRegistry::with_capacity(8);
        reg.next_sid = u16::MAX;
        let now = Instant::now();
        let a = reg.create(localhost(), now, ()).unwrap();
        let b = reg.create(localhost(), now, ()).unwrap();
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);
    }

    #[test]
    fn retransmission_cache() {
        let mut reg = SessionRegistry::with_capacity(8);
        let sid = reg.create(localhost(), Instant::now(), ()).unwrap();
        let session = reg.find_mut(sid).unwrap();
        assert!(!session.is_retransmit(0));

        session.remember(5, Bytes::from_static(b"\x01\x00\x05\x21\x00"));
        assert!(session.is_retransmit(5));
        assert!(!session.is_retransmit(6));
        assert_eq!(&session.last_frame()[..], b"\x01\x00\x05\x21\x00");
    }

    #[test]
    fn unbind_and_expire() {
        let mut reg = SessionRegistry::with_capacity(8);
        let start = Instant::now();
        let tcp = reg.create(localhost(), start, ()).unwrap();
        let udp = reg.create(localhost(), start, ()).unwrap();
        reg.find_mut(tcp).unwrap().bind(Some(42));

        let later = start + Duration::from_secs(100);
        let timeout = Duration::from_secs(10);
        assert_eq!(reg.expired(later, timeout), vec![udp]);

        assert_eq!(reg.unbind(42), 1);
        assert_eq!(reg.find(tcp).unwrap().conn(), None);
        let mut expired = reg.expired(later, timeout);
        expired.sort();
        assert_eq!(expired, vec![tcp, udp]);
    }
}
