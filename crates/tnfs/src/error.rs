//! TNFS error type and the errno to status code mapping.

use std::{fmt, io};

use crate::proto::Status;

/// Re-export of the host error numbers handlers usually return.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// Error returned by command handlers and by the server itself.
///
/// Handlers report a failure with `Err(Error::No(errno))` or by propagating an
/// `io::Error`; the dispatcher answers the request with [`Error::status`].
#[derive(Debug)]
pub enum Error {
    /// A host error number.
    No(nix::errno::Errno),
    /// An I/O error from the standard library.
    Io(io::Error),
    /// End of file or end of directory.
    Eof,
}

impl Error {
    /// Map this error to the TNFS status byte sent to the client.
    pub fn status(&self) -> Status {
        match *self {
            Error::No(e) => status_from_errno(e),
            Error::Io(ref e) => match e.raw_os_error() {
                Some(raw) => status_from_errno(nix::errno::Errno::from_raw(raw)),
                None => match e.kind() {
                    io::ErrorKind::NotFound => Status::ENOENT,
                    io::ErrorKind::PermissionDenied => Status::EACCES,
                    io::ErrorKind::AlreadyExists => Status::EEXIST,
                    io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Status::EINVAL,
                    io::ErrorKind::UnexpectedEof => Status::EOF,
                    io::ErrorKind::Unsupported => Status::ENOSYS,
                    _ => Status::EIO,
                },
            },
            Error::Eof => Status::EOF,
        }
    }
}

fn status_from_errno(e: nix::errno::Errno) -> Status {
    use nix::errno::Errno::*;

    match e {
        EPERM => Status::EPERM,
        ENOENT => Status::ENOENT,
        EIO => Status::EIO,
        ENXIO => Status::ENXIO,
        E2BIG => Status::E2BIG,
        EBADF => Status::EBADF,
        EAGAIN => Status::EAGAIN,
        ENOMEM => Status::ENOMEM,
        EACCES => Status::EACCES,
        EBUSY => Status::EBUSY,
        EEXIST => Status::EEXIST,
        ENOTDIR => Status::ENOTDIR,
        EISDIR => Status::EISDIR,
        EINVAL => Status::EINVAL,
        ENFILE => Status::ENFILE,
        EMFILE => Status::EMFILE,
        EFBIG => Status::EFBIG,
        ENOSPC => Status::ENOSPC,
        ESPIPE => Status::ESPIPE,
        EROFS => Status::EROFS,
        ENAMETOOLONG => Status::ENAMETOOLONG,
        ENOSYS => Status::ENOSYS,
        ENOTEMPTY => Status::ENOTEMPTY,
        ELOOP => Status::ELOOP,
        EPROTO => Status::EPROTO,
        EUSERS => Status::EUSERS,
        ENOBUFS => Status::ENOBUFS,
        EALREADY => Status::EALREADY,
        ESTALE => Status::ESTALE,
        _ => Status::EIO,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(ref e) => write!(f, "System error: {}", e.desc()),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::Eof => write!(f, "End of file"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::No(ref e) => Some(e),
            Error::Io(ref e) => Some(e),
            Error::Eof => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::No(e)
    }
}
