//! Serialize/deserialize TNFS payloads into/from binary.
//!
//! Integers are little-endian. Strings are NUL-terminated, unlike most other fields
//! of the protocol there is no length prefix.

use crate::{io_err, proto::*, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<
pub struct SResult<T>(pub ::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_all(self.as_bytes())?;
        w.write_u8(0)?;
        Ok(self.len() + 1)
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

impl Encodable for [u8] {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_all(self).and(Ok(self.len()))
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.size
            << &self.atime
            << &self.mtime
            << &self.ctime
            << &self.uid_name
            << &self.gid_name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.flags.bits()
            << &self.size
            << &self.mtime
            << &self.ctime
            << &self.name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Reply {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let buf = Encoder::new(w);
        let buf = match *self {
            Reply::Ok => return Ok(0),
            Reply::Handle(ref handle) => buf << handle,
            Reply::Name(ref name) => buf << name,
            Reply::Position(ref pos) => buf << pos,
            Reply::DirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            Reply::Entries {
                ref status,
                ref pos,
                ref entries,
            } => entries.iter().fold(
                buf << &(entries.len() as u8) << &status.bits() << pos,
                |acc, e| acc << e,
            ),
            Reply::Data(ref data) => buf << &(data.len() as u16) << &data[..],
            Reply::Count(ref count) => buf << count,
            Reply::Stat(ref stat) => buf << stat,
            Reply::Mount {
                ref version,
                ref min_retry_ms,
            } => buf << version << min_retry_ms,
        };

        match buf {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        loop {
            match r.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Decode the payload of a request whose command byte names `command`.
pub fn read_request<R: ReadBytesExt>(command: Command, mut buf: &mut R) -> Result<Request> {
    let request = match command {
        Command::Session(SessionCmd::Mount) => Request::Mount {
            version: decode!(buf),
            path: decode!(buf),
            user: decode!(buf),
            password: decode!(buf),
        },
        Command::Session(SessionCmd::Umount) => Request::Umount,

        Command::Directory(DirCmd::OpenDir) => Request::OpenDir { path: decode!(buf) },
        Command::Directory(DirCmd::ReadDir) => Request::ReadDir { handle: decode!(buf) },
        Command::Directory(DirCmd::CloseDir) => Request::CloseDir { handle: decode!(buf) },
        Command::Directory(DirCmd::MkDir) => Request::MkDir { path: decode!(buf) },
        Command::Directory(DirCmd::RmDir) => Request::RmDir { path: decode!(buf) },
        Command::Directory(DirCmd::TellDir) => Request::TellDir { handle: decode!(buf) },
        Command::Directory(DirCmd::SeekDir) => Request::SeekDir {
            handle: decode!(buf),
            pos: decode!(buf),
        },
        Command::Directory(DirCmd::OpenDirX) => Request::OpenDirX {
            options: decode!(DirOptions, buf),
            sort: decode!(SortOptions, buf),
            max_results: decode!(buf),
            pattern: decode!(buf),
            path: decode!(buf),
        },
        Command::Directory(DirCmd::ReadDirX) => Request::ReadDirX {
            handle: decode!(buf),
            count: decode!(buf),
        },

        Command::File(FileCmd::OpenOld) => Request::OpenOld,
        Command::File(FileCmd::Read) => Request::Read {
            fd: decode!(buf),
            size: decode!(buf),
        },
        Command::File(FileCmd::Write) => {
            let fd = decode!(buf);
            let size: u16 = decode!(buf);
            Request::Write {
                fd,
                data: read_exact(buf, size as usize)?,
            }
        }
        Command::File(FileCmd::Close) => Request::Close { fd: decode!(buf) },
        Command::File(FileCmd::Stat) => Request::Stat { path: decode!(buf) },
        Command::File(FileCmd::Seek) => {
            let fd = decode!(buf);
            let whence: u8 = decode!(buf);
            Request::Seek {
                fd,
                whence: match Whence::from_u8(whence) {
                    Some(whence) => whence,
                    None => return res!(io_err!(InvalidData, "Invalid seek origin")),
                },
                offset: decode!(buf),
            }
        }
        Command::File(FileCmd::Unlink) => Request::Unlink { path: decode!(buf) },
        Command::File(FileCmd::Chmod) => Request::Chmod {
            mode: decode!(buf),
            path: decode!(buf),
        },
        Command::File(FileCmd::Rename) => Request::Rename {
            from: decode!(buf),
            to: decode!(buf),
        },
        Command::File(FileCmd::Open) => Request::Open {
            flags: decode!(OpenFlags, buf),
            mode: decode!(buf),
            path: decode!(buf),
        },
    };

    Ok(request)
}

/// Helper function to write a response payload into a byte-oriented stream
pub fn write_reply<W: WriteBytesExt>(w: &mut W, reply: &Reply) -> Result<usize> {
    reply.encode(w)
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn string_is_nul_terminated() {
    use std::io::Cursor;

    let mut buf = Vec::new();
    assert_eq!("abc".encode(&mut buf).unwrap(), 4);
    assert_eq!(buf, b"abc\0");

    let mut r = Cursor::new(b"dir/file\0rest".to_vec());
    let s: String = Decodable::decode(&mut r).unwrap();
    assert_eq!(s, "dir/file");

    let mut r = Cursor::new(b"unterminated".to_vec());
    assert!(<String as Decodable>::decode(&mut r).is_err());
}

#[test]
fn decode_open_request() {
    use std::io::Cursor;

    let mut payload = vec![0x03, 0x01, 0xa4, 0x01];
    payload.extend_from_slice(b"/games/a.xex\0");

    let req = read_request(Command::File(FileCmd::Open), &mut Cursor::new(payload)).unwrap();
    assert_eq!(
        req,
        Request::Open {
            flags: OpenFlags::RDWR | OpenFlags::CREAT,
            mode: 0o644,
            path: "/games/a.xex".to_owned(),
        }
    );
}

#[test]
fn decode_mount_and_write() {
    use std::io::Cursor;

    let mut payload = vec![0x02, 0x01];
    payload.extend_from_slice(b"/\0\0\0");
    let req = read_request(Command::Session(SessionCmd::Mount), &mut Cursor::new(payload)).unwrap();
    assert_eq!(
        req,
        Request::Mount {
            version: 0x0102,
            path: "/".to_owned(),
            user: String::new(),
            password: String::new(),
        }
    );

    let payload = vec![0x01, 0x03, 0x00, b'x', b'y', b'z'];
    let req = read_request(Command::File(FileCmd::Write), &mut Cursor::new(payload)).unwrap();
    assert_eq!(req, Request::Write { fd: 1, data: b"xyz".to_vec() });

    // size field larger than the data carried
    let payload = vec![0x01, 0x09, 0x00, b'x'];
    assert!(read_request(Command::File(FileCmd::Write), &mut Cursor::new(payload)).is_err());
}

#[test]
fn decode_rejects_bad_seek_origin() {
    use std::io::Cursor;

    let payload = vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x00];
    assert!(read_request(Command::File(FileCmd::Seek), &mut Cursor::new(payload)).is_err());

    let payload = vec![0x02, 0x02, 0xfc, 0xff, 0xff, 0xff];
    let req = read_request(Command::File(FileCmd::Seek), &mut Cursor::new(payload)).unwrap();
    assert_eq!(
        req,
        Request::Seek {
            fd: 2,
            whence: Whence::End,
            offset: -4,
        }
    );
}

#[test]
fn encode_readdirx_reply() {
    let reply = Reply::Entries {
        status: DirStatus::EOF,
        pos: 3,
        entries: vec![DirEntry {
            flags: EntryFlags::DIR,
            size: 0,
            mtime: 1,
            ctime: 2,
            name: "sub".to_owned(),
        }],
    };

    let mut buf = Vec::new();
    let n = write_reply(&mut buf, &reply).unwrap();
    assert_eq!(n, buf.len());
    assert_eq!(
        buf,
        vec![
            1, 0x01, 3, 0, // count, dirstatus, dirpos
            0x01, 0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b's', b'u', b'b', 0,
        ]
    );
    assert_eq!(READDIRX_HDRSZ + 17, buf.len());
}

#[test]
fn encode_read_reply() {
    let mut buf = Vec::new();
    write_reply(&mut buf, &Reply::Data(vec![9, 8, 7])).unwrap();
    assert_eq!(buf, vec![3, 0, 9, 8, 7]);

    let mut buf = Vec::new();
    assert_eq!(write_reply(&mut buf, &Reply::Ok).unwrap(), 0);
    assert!(buf.is_empty());
}
