use std::{
    io,
    os::unix::io::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use log::{error, warn};
use nix::{
    errno::Errno,
    sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags},
};

use super::{MAX_FDS, Multiplexer, WaitResult, poll_timeout};

pub struct EpollMux {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

impl EpollMux {
    pub fn new() -> io::Result<EpollMux> {
        Ok(EpollMux {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            events: vec![EpollEvent::empty(); MAX_FDS],
        })
    }
}

impl Multiplexer for EpollMux {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&mut self, fd: BorrowedFd<'_>) -> bool {
        let event = EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            fd.as_raw_fd() as u64,
        );
        match self.epoll.add(fd, event) {
            Ok(()) => true,
            Err(e) => {
                warn!("epoll: can't register descriptor {}: {}", fd.as_raw_fd(), e);
                false
            }
        }
    }

    fn unregister(&mut self, fd: BorrowedFd<'_>) {
        let _ = self.epoll.delete(fd);
    }

    fn wait(&mut self, timeout: Duration) -> WaitResult {
        match self
            .epoll
            .wait(&mut self.events, poll_timeout(timeout))
        {
            Ok(n) => WaitResult::ready(
                self.events[..n]
                    .iter()
                    .map(|e| e.data() as RawFd)
                    .collect(),
            ),
            Err(Errno::EINTR) => WaitResult::default(),
            Err(e) => {
                error!("epoll_wait: {}", e);
                WaitResult::error()
            }
        }
    }
}
