use std::{
    io,
    os::unix::io::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use log::{error, warn};
use nix::{
    errno::Errno,
    libc::timespec,
    sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue},
};

use super::{MAX_FDS, Multiplexer, WaitResult};

pub struct KqueueMux {
    kq: Kqueue,
    events: Vec<KEvent>,
}

fn read_event(fd: RawFd, flags: EventFlag) -> KEvent {
    KEvent::new(
        fd as usize,
        EventFilter::EVFILT_READ,
        flags,
        FilterFlag::empty(),
        0,
        0,
    )
}

impl KqueueMux {
    pub fn new() -> io::Result<KqueueMux> {
        Ok(KqueueMux {
            kq: Kqueue::new()?,
            events: vec![read_event(0, EventFlag::empty()); MAX_FDS],
        })
    }
}

impl Multiplexer for KqueueMux {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn register(&mut self, fd: BorrowedFd<'_>) -> bool {
        let change = [read_event(fd.as_raw_fd(), EventFlag::EV_ADD)];
        match self.kq.kevent(&change, &mut [], None) {
            Ok(_) => true,
            Err(e) => {
                warn!("kqueue: can't register descriptor {}: {}", fd.as_raw_fd(), e);
                false
            }
        }
    }

    fn unregister(&mut self, fd: BorrowedFd<'_>) {
        let change = [read_event(fd.as_raw_fd(), EventFlag::EV_DELETE)];
        let _ = self.kq.kevent(&change, &mut [], None);
    }

    fn wait(&mut self, timeout: Duration) -> WaitResult {
        let ts = timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        match self.kq.kevent(&[], &mut self.events, Some(ts)) {
            Ok(n) => WaitResult::ready(
                self.events[..n]
                    .iter()
                    .map(|e| e.ident() as RawFd)
                    .collect(),
            ),
            Err(Errno::EINTR) => WaitResult::default(),
            Err(e) => {
                error!("kevent: {}", e);
                WaitResult::error()
            }
        }
    }
}
