//! Readiness notification over epoll, kqueue, `poll(2)` and `select(2)`.
//!
//! The reactor only needs one thing from the OS: which of a small set of sockets can
//! be read without blocking. [`Multiplexer`] is that interface, and [`BackendKind`]
//! selects the implementation when the server starts.

use std::{
    collections::BTreeMap,
    fmt, io,
    os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd},
    str::FromStr,
    time::Duration,
};

use nix::poll::PollTimeout;

use crate::io_err;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod poll;
mod select;

/// Upper bound of descriptors a backend tracks
pub const MAX_FDS: usize = 4096;

/// Outcome of a single [`Multiplexer::wait`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WaitResult {
    ready: Vec<RawFd>,
    error: bool,
}

impl WaitResult {
    /// A wait which found `fds` readable. Duplicates are dropped.
    pub fn ready(mut fds: Vec<RawFd>) -> WaitResult {
        fds.sort_unstable();
        fds.dedup();
        WaitResult {
            ready: fds,
            error: false,
        }
    }

    /// A wait which failed at the transport level
    pub fn error() -> WaitResult {
        WaitResult {
            ready: Vec::new(),
            error: true,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// True for a timeout (and for an error)
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_active(&self, fd: RawFd) -> bool {
        self.ready.binary_search(&fd).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.ready.iter().copied()
    }
}

/// OS readiness notification.
///
/// Backends are level triggered: a descriptor with unread data is reported again by
/// the next `wait`, however many bytes arrived.
pub trait Multiplexer {
    /// Name of the backend, for logging
    fn name(&self) -> &'static str;

    /// Start watching `fd` for readability.
    ///
    /// Returns `false` if the backend refused the descriptor; it must then not be
    /// treated as active.
    fn register(&mut self, fd: BorrowedFd<'_>) -> bool;

    /// Stop watching `fd`. Unknown descriptors are ignored.
    fn unregister(&mut self, fd: BorrowedFd<'_>);

    /// Block up to `timeout` and report the registered descriptors which became
    /// readable.
    fn wait(&mut self, timeout: Duration) -> WaitResult;
}

/// The available readiness mechanisms
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Epoll,
    Kqueue,
    Poll,
    Select,
}

impl BackendKind {
    /// The preferred backend of the host
    pub fn native() -> BackendKind {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            BackendKind::Epoll
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            BackendKind::Kqueue
        } else {
            BackendKind::Poll
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Poll => "poll",
            BackendKind::Select => "select",
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::native()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<BackendKind> {
        match s {
            "epoll" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "poll" => Ok(BackendKind::Poll),
            "select" => Ok(BackendKind::Select),
            _ => Err(io_err!(InvalidInput, format!("unknown event backend: {}", s))),
        }
    }
}

/// Create the multiplexer of the given kind.
///
/// Fails if the kernel refuses to create the backend or if the backend does not
/// exist on this platform.
pub fn new_multiplexer(kind: BackendKind) -> io::Result<Box<dyn Multiplexer>> {
    match kind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        BackendKind::Epoll => Ok(Box::new(epoll::EpollMux::new()?)),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueMux::new()?)),
        BackendKind::Poll => Ok(Box::new(poll::PollMux::new())),
        BackendKind::Select => Ok(Box::new(select::SelectMux::new())),
        #[allow(unreachable_patterns)]
        _ => Err(io_err!(
            Unsupported,
            format!("event backend {} is not available on this platform", kind)
        )),
    }
}

/// Timeout of `epoll_wait(2)` and `poll(2)`, saturating at their `i32` milliseconds
fn poll_timeout(timeout: Duration) -> PollTimeout {
    PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX)
}

/// Descriptors watched by the scanning backends.
///
/// `poll(2)` and `select(2)` need the descriptors at every wait, so each registration
/// keeps a duplicate alive until it is unregistered. Entries are keyed by the
/// caller's descriptor, which is what `wait` reports.
#[derive(Debug, Default)]
struct Watched {
    fds: BTreeMap<RawFd, OwnedFd>,
}

impl Watched {
    fn insert(&mut self, fd: BorrowedFd<'_>) -> io::Result<RawFd> {
        let dup = fd.try_clone_to_owned()?;
        let raw = dup.as_raw_fd();
        self.fds.insert(fd.as_raw_fd(), dup);
        Ok(raw)
    }

    fn remove(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn iter(&self) -> impl Iterator<Item = (RawFd, BorrowedFd<'_>)> {
        use std::os::unix::io::AsFd;

        self.fds.iter().map(|(raw, fd)| (*raw, fd.as_fd()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::UdpSocket, os::unix::io::AsFd};

    fn backends() -> Vec<BackendKind> {
        let mut kinds = vec![BackendKind::Poll, BackendKind::Select];
        if BackendKind::native() != BackendKind::Poll {
            kinds.push(BackendKind::native());
        }
        kinds
    }

    fn socket_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        (a, b)
    }

    #[test]
    fn wait_times_out_empty() {
        for kind in backends() {
            let mut mux = new_multiplexer(kind).unwrap();
            let (a, _b) = socket_pair();
            assert!(mux.register(a.as_fd()));

            let res = mux.wait(Duration::from_millis(10));
            assert!(!res.is_error(), "{}", kind);
            assert!(res.is_empty(), "{}", kind);
        }
    }

    #[test]
    fn readable_socket_is_reported_once() {
        for kind in backends() {
            let mut mux = new_multiplexer(kind).unwrap();
            let (a, b) = socket_pair();
            let (idle, _other) = socket_pair();
            assert!(mux.register(a.as_fd()));
            assert!(mux.register(idle.as_fd()));

            b.send_to(b"one", a.local_addr().unwrap()).unwrap();
            b.send_to(b"two", a.local_addr().unwrap()).unwrap();

            let res = mux.wait(Duration::from_secs(2));
            assert_eq!(res.len(), 1, "{}", kind);
            assert!(res.is_active(a.as_raw_fd()), "{}", kind);
            assert!(!res.is_active(idle.as_raw_fd()), "{}", kind);

            // one datagram consumed, the other must still be reported
            let mut buf = [0u8; 8];
            a.recv_from(&mut buf).unwrap();
            let res = mux.wait(Duration::from_secs(2));
            assert!(res.is_active(a.as_raw_fd()), "{}", kind);
        }
    }

    #[test]
    fn unregistered_socket_is_not_reported() {
        for kind in backends() {
            let mut mux = new_multiplexer(kind).unwrap();
            let (a, b) = socket_pair();
            assert!(mux.register(a.as_fd()));
            mux.unregister(a.as_fd());
            // idempotent
            mux.unregister(a.as_fd());

            b.send_to(b"x", a.local_addr().unwrap()).unwrap();
            let res = mux.wait(Duration::from_millis(50));
            assert!(!res.is_active(a.as_raw_fd()), "{}", kind);
        }
    }

    #[test]
    fn long_timeouts_are_kept() {
        assert_eq!(i32::from(poll_timeout(Duration::from_secs(100))), 100_000);
        assert_eq!(i32::from(poll_timeout(Duration::from_millis(1500))), 1500);
        assert_eq!(poll_timeout(Duration::from_secs(u64::MAX)), PollTimeout::MAX);

        // a ready descriptor still ends a long wait at once
        for kind in backends() {
            let mut mux = new_multiplexer(kind).unwrap();
            let (a, b) = socket_pair();
            assert!(mux.register(a.as_fd()));
            b.send_to(b"x", a.local_addr().unwrap()).unwrap();
            let res = mux.wait(Duration::from_secs(120));
            assert!(res.is_active(a.as_raw_fd()), "{}", kind);
        }
    }

    #[test]
    fn wait_result_dedups() {
        let res = WaitResult::ready(vec![7, 3, 7]);
        assert_eq!(res.len(), 2);
        assert!(res.is_active(3));
        assert!(!res.is_active(4));
        assert!(WaitResult::error().is_error());
    }

    #[test]
    fn backend_names_parse() {
        for kind in [
            BackendKind::Epoll,
            BackendKind::Kqueue,
            BackendKind::Poll,
            BackendKind::Select,
        ] {
            assert_eq!(kind.name().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("devpoll".parse::<BackendKind>().is_err());
    }
}
