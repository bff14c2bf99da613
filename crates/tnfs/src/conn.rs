//! Fixed-capacity table of TCP client connections.

use std::{
    net::{SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
    time::{Duration, Instant},
};

/// An accepted TCP connection
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    last_contact: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, now: Instant) -> Connection {
        Connection {
            stream,
            peer,
            last_contact: now,
        }
    }

    /// The connection handle sessions are bound to
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    /// True if nothing arrived on this connection for longer than `timeout`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_contact) > timeout
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Active TCP connections.
///
/// The table never holds more than `capacity` connections; occupancy is independent
/// of sessions, which merely refer to a connection by its handle.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
}

impl ConnectionTable {
    pub fn with_capacity(capacity: usize) -> ConnectionTable {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        ConnectionTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Store `conn` in a free slot.
    ///
    /// Hands the connection back if the table is full.
    pub fn insert(&mut self, conn: Connection) -> std::result::Result<usize, Connection> {
        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(conn);
                Ok(slot)
            }
            None => Err(conn),
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.slots.iter().flatten().find(|c| c.fd() == fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.slots.iter_mut().flatten().find(|c| c.fd() == fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.get(fd).is_some()
    }

    /// Free the slot holding `fd`, returning its connection
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|c| c.fd() == fd))
            .and_then(Option::take)
    }

    /// Handles of the connections idle for longer than `timeout`
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<RawFd> {
        self.iter()
            .filter(|c| c.is_stale(now, timeout))
            .map(Connection::fd)
            .collect()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.iter().map(Connection::fd).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().flatten()
    }
}
