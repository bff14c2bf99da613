use std::{
    os::unix::io::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use log::{error, warn};
use nix::{
    errno::Errno,
    libc::{FD_SETSIZE, c_int},
    sys::{
        select::{FdSet, select},
        time::TimeVal,
    },
};

use super::{Multiplexer, WaitResult, Watched};

#[derive(Debug, Default)]
pub struct SelectMux {
    watched: Watched,
}

impl SelectMux {
    pub fn new() -> SelectMux {
        SelectMux::default()
    }
}

// An fd_set holds descriptors below FD_SETSIZE only
fn fits(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < FD_SETSIZE as usize
}

impl Multiplexer for SelectMux {
    fn name(&self) -> &'static str {
        "select"
    }

    fn register(&mut self, fd: BorrowedFd<'_>) -> bool {
        if !fits(fd.as_raw_fd()) {
            warn!("select: can't register descriptor {}: above FD_SETSIZE", fd.as_raw_fd());
            return false;
        }
        match self.watched.insert(fd) {
            Ok(dup) if fits(dup) => true,
            Ok(_) => {
                self.watched.remove(fd.as_raw_fd());
                warn!("select: can't register descriptor {}: above FD_SETSIZE", fd.as_raw_fd());
                false
            }
            Err(e) => {
                warn!("select: can't register descriptor {}: {}", fd.as_raw_fd(), e);
                false
            }
        }
    }

    fn unregister(&mut self, fd: BorrowedFd<'_>) {
        self.watched.remove(fd.as_raw_fd());
    }

    fn wait(&mut self, timeout: Duration) -> WaitResult {
        let mut readfds = FdSet::new();
        let mut errfds = FdSet::new();
        for (_, fd) in self.watched.iter() {
            readfds.insert(fd);
            errfds.insert(fd);
        }
        let mut tv = TimeVal::new(timeout.as_secs() as _, timeout.subsec_micros() as _);

        match select(
            None::<c_int>,
            Some(&mut readfds),
            None::<&mut FdSet>,
            Some(&mut errfds),
            Some(&mut tv),
        ) {
            Ok(0) => WaitResult::default(),
            Ok(_) => WaitResult::ready(
                self.watched
                    .iter()
                    .filter(|(_, fd)| readfds.contains(*fd) || errfds.contains(*fd))
                    .map(|(raw, _)| raw)
                    .collect(),
            ),
            Err(Errno::EINTR) => WaitResult::default(),
            Err(e) => {
                error!("select: {}", e);
                WaitResult::error()
            }
        }
    }
}
