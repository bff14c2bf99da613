use std::{
    os::unix::io::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use log::{error, warn};
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, poll},
};

use super::{MAX_FDS, Multiplexer, WaitResult, Watched, poll_timeout};

#[derive(Debug, Default)]
pub struct PollMux {
    watched: Watched,
}

impl PollMux {
    pub fn new() -> PollMux {
        PollMux::default()
    }
}

impl Multiplexer for PollMux {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&mut self, fd: BorrowedFd<'_>) -> bool {
        if self.watched.len() >= MAX_FDS {
            warn!("poll: can't register descriptor {}: table full", fd.as_raw_fd());
            return false;
        }
        match self.watched.insert(fd) {
            Ok(_) => true,
            Err(e) => {
                warn!("poll: can't register descriptor {}: {}", fd.as_raw_fd(), e);
                false
            }
        }
    }

    fn unregister(&mut self, fd: BorrowedFd<'_>) {
        self.watched.remove(fd.as_raw_fd());
    }

    fn wait(&mut self, timeout: Duration) -> WaitResult {
        let raws: Vec<RawFd> = self.watched.iter().map(|(raw, _)| raw).collect();
        let mut pollfds: Vec<PollFd> = self
            .watched
            .iter()
            .map(|(_, fd)| PollFd::new(fd, PollFlags::POLLIN))
            .collect();

        match poll(&mut pollfds, poll_timeout(timeout)) {
            Ok(0) => WaitResult::default(),
            Ok(_) => {
                let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                WaitResult::ready(
                    raws.into_iter()
                        .zip(pollfds.iter())
                        .filter(|(_, p)| p.revents().is_some_and(|r| r.intersects(wake)))
                        .map(|(raw, _)| raw)
                        .collect(),
                )
            }
            Err(Errno::EINTR) => WaitResult::default(),
            Err(e) => {
                error!("poll: {}", e);
                WaitResult::error()
            }
        }
    }
}
