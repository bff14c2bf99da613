//! TNFS protocol data types and constants.
//!
//! # Protocol
//! TNFS 1.2

use std::fmt;
use std::mem::size_of_val;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use enum_primitive::*;

/// Protocol version 1.2, least significant byte first on the wire
pub const PROTOVERSION_LSB: u8 = 0x02;
pub const PROTOVERSION_MSB: u8 = 0x01;
pub const PROTOVERSION: u16 = (PROTOVERSION_MSB as u16) << 8 | PROTOVERSION_LSB as u16;

/// Default UDP and TCP port
pub const TNFSD_PORT: u16 = 16384;

/// session[2] seqno[1] command[1]
pub const HEADER_SIZE: usize = 4;

/// Largest message in either direction
pub const MAXMSGSZ: usize = 532;

/// Largest block moved by a single `Read` or `Write`
pub const MAX_IOSZ: usize = 512;

/// Room left for a response payload after the header and the status byte
pub const MAX_PAYLOAD: usize = MAXMSGSZ - HEADER_SIZE - 1;

/// Minimum retry time in milliseconds advertised to clients on mount
pub const MIN_RETRY_MS: u16 = 1000;

/// Size of the frame sent to a TCP client when the connection table is full
pub const REJECT_FRAME_SIZE: usize = 9;

/*
 * Command classes, the high nibble of the command byte
 */
pub const CLASS_SESSION: u8 = 0x00;
pub const CLASS_DIRECTORY: u8 = 0x10;
pub const CLASS_FILE: u8 = 0x20;

/// Raw command bytes
pub mod cmd {
    pub const MOUNT: u8 = 0x00;
    pub const UMOUNT: u8 = 0x01;

    pub const OPENDIR: u8 = 0x10;
    pub const READDIR: u8 = 0x11;
    pub const CLOSEDIR: u8 = 0x12;
    pub const MKDIR: u8 = 0x13;
    pub const RMDIR: u8 = 0x14;
    pub const TELLDIR: u8 = 0x15;
    pub const SEEKDIR: u8 = 0x16;
    pub const OPENDIRX: u8 = 0x17;
    pub const READDIRX: u8 = 0x18;

    pub const OPENFILE_OLD: u8 = 0x20;
    pub const READ: u8 = 0x21;
    pub const WRITE: u8 = 0x22;
    pub const CLOSE: u8 = 0x23;
    pub const STAT: u8 = 0x24;
    pub const LSEEK: u8 = 0x25;
    pub const UNLINK: u8 = 0x26;
    pub const CHMOD: u8 = 0x27;
    pub const RENAME: u8 = 0x28;
    pub const OPEN: u8 = 0x29;
}

enum_from_primitive! {
    #[doc = "Status byte of a response"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Status {
        Success         = 0x00,
        EPERM,
        ENOENT,
        EIO,
        ENXIO,
        E2BIG,
        EBADF,
        EAGAIN,
        ENOMEM,
        EACCES,
        EBUSY,
        EEXIST,
        ENOTDIR,
        EISDIR,
        EINVAL,
        ENFILE,
        EMFILE,
        EFBIG,
        ENOSPC,
        ESPIPE,
        EROFS,
        ENAMETOOLONG,
        ENOSYS,
        ENOTEMPTY,
        ELOOP,
        ENODATA,
        ENOSTR,
        EPROTO,
        EBADFD,
        EUSERS,
        ENOBUFS,
        EALREADY,
        ESTALE,
        EOF             = 0x21,
        // Invalid session ID, also "too many connections"
        BadSession      = 0xff,
    }
}

enum_from_primitive! {
    #[doc = "Commands of the session class"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum SessionCmd {
        Mount           = 0,
        Umount,
    }
}

enum_from_primitive! {
    #[doc = "Commands of the directory class"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum DirCmd {
        OpenDir         = 0,
        ReadDir,
        CloseDir,
        MkDir,
        RmDir,
        TellDir,
        SeekDir,
        OpenDirX,
        ReadDirX,
    }
}

enum_from_primitive! {
    #[doc = "Commands of the file class"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum FileCmd {
        OpenOld         = 0,    // TNFS 1.0 open, superseded by Open
        Read,
        Write,
        Close,
        Stat,
        Seek,
        Unlink,
        Chmod,
        Rename,
        Open,
    }
}

/// A command byte split into its class and its index within the class.
///
/// Only bytes which name an entry of one of the command tables convert into a
/// `Command`; everything else is an unknown command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Session(SessionCmd),
    Directory(DirCmd),
    File(FileCmd),
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Command> {
        use num_traits::FromPrimitive;

        let index = byte & 0x0f;
        match byte & 0xf0 {
            CLASS_SESSION => SessionCmd::from_u8(index).map(Command::Session),
            CLASS_DIRECTORY => DirCmd::from_u8(index).map(Command::Directory),
            CLASS_FILE => FileCmd::from_u8(index).map(Command::File),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Command::Session(c) => CLASS_SESSION | c as u8,
            Command::Directory(c) => CLASS_DIRECTORY | c as u8,
            Command::File(c) => CLASS_FILE | c as u8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Session(SessionCmd::Mount) => "TNFS_MOUNT",
            Command::Session(SessionCmd::Umount) => "TNFS_UMOUNT",
            Command::Directory(DirCmd::OpenDir) => "TNFS_OPENDIR",
            Command::Directory(DirCmd::ReadDir) => "TNFS_READDIR",
            Command::Directory(DirCmd::CloseDir) => "TNFS_CLOSEDIR",
            Command::Directory(DirCmd::MkDir) => "TNFS_MKDIR",
            Command::Directory(DirCmd::RmDir) => "TNFS_RMDIR",
            Command::Directory(DirCmd::TellDir) => "TNFS_TELLDIR",
            Command::Directory(DirCmd::SeekDir) => "TNFS_SEEKDIR",
            Command::Directory(DirCmd::OpenDirX) => "TNFS_OPENDIRX",
            Command::Directory(DirCmd::ReadDirX) => "TNFS_READDIRX",
            Command::File(FileCmd::OpenOld) => "TNFS_OPENFILE_OLD",
            Command::File(FileCmd::Read) => "TNFS_READ",
            Command::File(FileCmd::Write) => "TNFS_WRITE",
            Command::File(FileCmd::Close) => "TNFS_CLOSE",
            Command::File(FileCmd::Stat) => "TNFS_STAT",
            Command::File(FileCmd::Seek) => "TNFS_SEEK",
            Command::File(FileCmd::Unlink) => "TNFS_UNLINK",
            Command::File(FileCmd::Chmod) => "TNFS_CHMOD",
            Command::File(FileCmd::Rename) => "TNFS_RENAME",
            Command::File(FileCmd::Open) => "TNFS_OPEN",
        }
    }
}

/// Canonical name of a raw command byte, for logging
pub fn command_name(byte: u8) -> &'static str {
    Command::from_byte(byte).map_or("UNKNOWN_CMD", Command::name)
}

bitflags! {
    /// Flags of the `Open` command
    ///
    /// TNFS uses its own values, which differ from the host's `O_*` flags.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct OpenFlags: u16 {
        const RDONLY    = 0x0001;
        const WRONLY    = 0x0002;
        const RDWR      = 0x0003;
        const APPEND    = 0x0008;
        const CREAT     = 0x0100;
        const TRUNC     = 0x0200;
        const EXCL      = 0x0400;
    }
}

bitflags! {
    /// Options of the `OpenDirX` command
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DirOptions: u8 {
        #[doc = "Don't list directories ahead of files"]
        const NO_FOLDERSFIRST   = 0x01;
        #[doc = "List entries whose name starts with a dot"]
        const NO_SKIPHIDDEN     = 0x02;
        #[doc = "List entries which are neither files nor directories"]
        const NO_SKIPSPECIAL    = 0x04;
        #[doc = "Apply the pattern to directories as well"]
        const DIR_PATTERN       = 0x08;
        #[doc = "Don't list directories at all"]
        const NO_FOLDERS        = 0x10;
    }
}

bitflags! {
    /// Sort options of the `OpenDirX` command
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SortOptions: u8 {
        const NONE          = 0x01;
        const CASE          = 0x02;
        const DESCENDING    = 0x04;
        const MODIFIED      = 0x08;
        const SIZE          = 0x10;
    }
}

bitflags! {
    /// Per entry flags in a `ReadDirX` response
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct EntryFlags: u8 {
        const DIR       = 0x01;
        const HIDDEN    = 0x02;
        const SPECIAL   = 0x04;
    }
}

bitflags! {
    /// Directory status in a `ReadDirX` response
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DirStatus: u8 {
        const EOF       = 0x01;
    }
}

enum_from_primitive! {
    #[doc = "Origin of a `Seek`"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Whence {
        Set             = 0,
        Cur,
        End,
    }
}

/// The transport a request arrived on and its reply must leave on.
///
/// `Tcp` carries the descriptor of the client connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp(RawFd),
}

impl Transport {
    /// The connection a session gets bound to by a request on this transport
    pub fn conn(self) -> Option<RawFd> {
        match self {
            Transport::Udp => None,
            Transport::Tcp(fd) => Some(fd),
        }
    }
}

/// Header of a request, reused to address its response
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub sid: u16,
    pub seqno: u8,
    pub cmd: u8,
    pub peer: SocketAddr,
    pub transport: Transport,
    pub status: Status,
}

impl Header {
    /// Split a received message into its header and payload.
    ///
    /// Returns `None` if `buf` is shorter than the fixed header.
    pub fn decode(buf: &[u8], peer: SocketAddr, transport: Transport) -> Option<(Header, &[u8])> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let hdr = Header {
            sid: u16::from_le_bytes([buf[0], buf[1]]),
            seqno: buf[2],
            cmd: buf[3],
            peer,
            transport,
            status: Status::Success,
        };
        Some((hdr, &buf[HEADER_SIZE..]))
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} s={:04x} c={:02x} q={:02x}",
            self.peer.ip(),
            self.sid,
            self.cmd,
            self.seqno
        )
    }
}

/// File attributes returned by `Stat`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Owner name
    pub uid_name: String,
    /// Group name
    pub gid_name: String,
}

/// Directory entry used in `ReadDirX` responses
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub flags: EntryFlags,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub name: String,
}

impl DirEntry {
    /// Encoded size of this entry, including the name's terminator
    pub fn size(&self) -> usize {
        size_of_val(&self.flags.bits())
            + size_of_val(&self.size)
            + size_of_val(&self.mtime)
            + size_of_val(&self.ctime)
            + self.name.len()
            + 1
    }
}

/// Size of the fixed fields which precede the entries of a `ReadDirX` response
///
/// count[1] dirstatus[1] dirpos[2]
pub const READDIRX_HDRSZ: usize = 4;

/// A decoded request payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Mount {
        version: u16,
        path: String,
        user: String,
        password: String,
    },
    Umount,

    OpenDir {
        path: String,
    },
    ReadDir {
        handle: u8,
    },
    CloseDir {
        handle: u8,
    },
    MkDir {
        path: String,
    },
    RmDir {
        path: String,
    },
    TellDir {
        handle: u8,
    },
    SeekDir {
        handle: u8,
        pos: u32,
    },
    OpenDirX {
        options: DirOptions,
        sort: SortOptions,
        max_results: u16,
        pattern: String,
        path: String,
    },
    ReadDirX {
        handle: u8,
        count: u8,
    },

    OpenOld,
    Read {
        fd: u8,
        size: u16,
    },
    Write {
        fd: u8,
        data: Vec<u8>,
    },
    Close {
        fd: u8,
    },
    Stat {
        path: String,
    },
    Seek {
        fd: u8,
        whence: Whence,
        offset: i32,
    },
    Unlink {
        path: String,
    },
    Chmod {
        mode: u16,
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Open {
        flags: OpenFlags,
        mode: u16,
        path: String,
    },
}

/// Payload of a successful response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Status only
    Ok,
    /// A new directory or file handle
    Handle(u8),
    /// A single directory entry name
    Name(String),
    /// A directory or file position
    Position(u32),
    /// `OpenDirX`: the handle and the number of entries matched
    DirX { handle: u8, count: u16 },
    /// `ReadDirX`: a batch of entries
    Entries {
        status: DirStatus,
        pos: u16,
        entries: Vec<DirEntry>,
    },
    /// Bytes read
    Data(Vec<u8>),
    /// Bytes written
    Count(u16),
    Stat(Stat),
    /// `Mount`: the server version and the minimum retry time
    Mount { version: u16, min_retry_ms: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_table_lookup() {
        assert_eq!(
            Command::from_byte(cmd::MOUNT),
            Some(Command::Session(SessionCmd::Mount))
        );
        assert_eq!(
            Command::from_byte(cmd::READDIRX),
            Some(Command::Directory(DirCmd::ReadDirX))
        );
        assert_eq!(
            Command::from_byte(cmd::OPEN),
            Some(Command::File(FileCmd::Open))
        );

        // past the end of each table
        assert_eq!(Command::from_byte(0x02), None);
        assert_eq!(Command::from_byte(0x19), None);
        assert_eq!(Command::from_byte(0x2a), None);
        assert_eq!(Command::from_byte(0x2f), None);
        // unknown classes
        assert_eq!(Command::from_byte(0x30), None);
        assert_eq!(Command::from_byte(0xf0), None);
    }

    #[test]
    fn command_byte_roundtrips_through_tables() {
        for byte in 0..=u8::MAX {
            if let Some(c) = Command::from_byte(byte) {
                assert_eq!(c.byte(), byte);
            }
        }
        assert_eq!(command_name(cmd::RENAME), "TNFS_RENAME");
        assert_eq!(command_name(0x3f), "UNKNOWN_CMD");
    }

    #[test]
    fn header_decode() {
        let peer: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let buf = [0x34, 0x12, 0x07, cmd::READ, 0xaa, 0xbb];
        let (hdr, payload) = Header::decode(&buf, peer, Transport::Udp).unwrap();

        assert_eq!(hdr.sid, 0x1234);
        assert_eq!(hdr.seqno, 7);
        assert_eq!(hdr.cmd, cmd::READ);
        assert_eq!(payload, &[0xaa, 0xbb]);
        assert_eq!(hdr.to_string(), "10.0.0.2 s=1234 c=21 q=07");

        assert!(Header::decode(&buf[..3], peer, Transport::Udp).is_none());
    }

    #[test]
    fn protocol_version() {
        assert_eq!(PROTOVERSION.to_le_bytes(), [PROTOVERSION_LSB, PROTOVERSION_MSB]);
    }
}
