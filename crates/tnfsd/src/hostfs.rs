//! `Filesystem` over a directory of the host.

use {
    crate::{
        INVALID_HANDLE,
        dirlist::{self, ListOptions},
        utils::*,
    },
    log::debug,
    std::{
        fs::{self, File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        os::unix::fs::{OpenOptionsExt, PermissionsExt},
        path::{Path, PathBuf},
    },
    tnfs::{
        errno::*,
        srv::Filesystem,
        *,
    },
};

/// Open files per session
pub const MAX_FILES: usize = 16;
/// Open directory handles per session
pub const MAX_DIRS: usize = 8;

/// Fixed number of slots addressed by a one byte handle
#[derive(Debug)]
struct HandleTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> HandleTable<T> {
    fn with_capacity(capacity: usize) -> HandleTable<T> {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        HandleTable { slots }
    }

    fn insert(&mut self, value: T) -> Result<u8> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::No(EMFILE))?;
        self.slots[slot] = Some(value);
        Ok(slot as u8)
    }

    fn get_mut(&mut self, handle: u8) -> Result<&mut T> {
        self.slots
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(INVALID_HANDLE!())
    }

    fn remove(&mut self, handle: u8) -> Result<T> {
        self.slots
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or(INVALID_HANDLE!())
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// An open directory: its entries, read on open, and the read position
#[derive(Debug)]
struct DirHandle {
    entries: Vec<DirEntry>,
    pos: usize,
}

/// State of a mounted session
#[derive(Debug)]
pub struct HostSession {
    root: PathBuf,
    files: HandleTable<File>,
    dirs: HandleTable<DirHandle>,
}

impl Default for HostSession {
    fn default() -> Self {
        HostSession {
            root: PathBuf::new(),
            files: HandleTable::with_capacity(MAX_FILES),
            dirs: HandleTable::with_capacity(MAX_DIRS),
        }
    }
}

impl HostSession {
    fn path(&self, path: &str) -> PathBuf {
        resolve(&self.root, path)
    }

    /// Like `path`, but refuses the session root itself
    fn child(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.path(path);
        if resolved == self.root {
            return Err(Error::No(EACCES));
        }
        Ok(resolved)
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    pub fn open_dirs(&self) -> usize {
        self.dirs.len()
    }
}

#[derive(Clone, Debug)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new<P: AsRef<Path>>(root: P) -> HostFs {
        HostFs {
            root: root.as_ref().to_path_buf(),
        }
    }
}

fn open_options(flags: OpenFlags, mode: u16) -> Result<OpenOptions> {
    let mut options = OpenOptions::new();
    match flags & OpenFlags::RDWR {
        f if f == OpenFlags::RDWR => options.read(true).write(true),
        f if f == OpenFlags::WRONLY => options.write(true),
        f if f == OpenFlags::RDONLY => options.read(true),
        _ => return Err(Error::No(EINVAL)),
    };
    options
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNC))
        .mode(u32::from(mode));
    if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
        options.create_new(true);
    } else {
        options.create(flags.contains(OpenFlags::CREAT));
    }
    Ok(options)
}

impl Filesystem for HostFs {
    type Session = HostSession;

    fn rmount(&self, session: &mut HostSession, path: &str, user: &str, _password: &str) -> Result<()> {
        let root = resolve(&self.root, path);
        if !fs::metadata(&root)?.is_dir() {
            return Err(Error::No(ENOTDIR));
        }
        debug!("Mounting {:?} for user {:?}", root, user);
        session.root = root;
        Ok(())
    }

    fn rumount(&self, session: &mut HostSession) {
        debug!(
            "Unmounting {:?}: closing {} files and {} directories",
            session.root,
            session.open_files(),
            session.open_dirs()
        );
        session.files.clear();
        session.dirs.clear();
    }

    fn ropendir(&self, session: &mut HostSession, path: &str) -> Result<Reply> {
        let mut entries = vec![
            DirEntry {
                name: ".".to_owned(),
                ..Default::default()
            },
            DirEntry {
                name: "..".to_owned(),
                ..Default::default()
            },
        ];
        for entry in fs::read_dir(session.path(path))? {
            entries.push(DirEntry {
                name: entry?.file_name().to_string_lossy().into_owned(),
                ..Default::default()
            });
        }

        let handle = session.dirs.insert(DirHandle { entries, pos: 0 })?;
        Ok(Reply::Handle(handle))
    }

    fn rreaddir(&self, session: &mut HostSession, handle: u8) -> Result<Reply> {
        let dir = session.dirs.get_mut(handle)?;
        let entry = dir.entries.get(dir.pos).ok_or(Error::Eof)?;
        let name = entry.name.clone();
        dir.pos += 1;
        Ok(Reply::Name(name))
    }

    fn rclosedir(&self, session: &mut HostSession, handle: u8) -> Result<Reply> {
        session.dirs.remove(handle)?;
        Ok(Reply::Ok)
    }

    fn rmkdir(&self, session: &mut HostSession, path: &str) -> Result<Reply> {
        fs::create_dir(session.path(path))?;
        Ok(Reply::Ok)
    }

    fn rrmdir(&self, session: &mut HostSession, path: &str) -> Result<Reply> {
        fs::remove_dir(session.child(path)?)?;
        Ok(Reply::Ok)
    }

    fn rtelldir(&self, session: &mut HostSession, handle: u8) -> Result<Reply> {
        let dir = session.dirs.get_mut(handle)?;
        Ok(Reply::Position(clamp_u32(dir.pos)))
    }

    fn rseekdir(&self, session: &mut HostSession, handle: u8, pos: u32) -> Result<Reply> {
        let dir = session.dirs.get_mut(handle)?;
        dir.pos = (pos as usize).min(dir.entries.len());
        Ok(Reply::Ok)
    }

    fn ropendirx(
        &self,
        session: &mut HostSession,
        options: DirOptions,
        sort: SortOptions,
        max_results: u16,
        pattern: &str,
        path: &str,
    ) -> Result<Reply> {
        let opts = ListOptions {
            options,
            sort,
            max_results,
            pattern: pattern.to_owned(),
        };
        let entries = dirlist::list(&session.path(path), &opts)?;
        let count = entries.len().min(u16::MAX as usize) as u16;

        let handle = session.dirs.insert(DirHandle { entries, pos: 0 })?;
        Ok(Reply::DirX { handle, count })
    }

    fn rreaddirx(&self, session: &mut HostSession, handle: u8, count: u8) -> Result<Reply> {
        let dir = session.dirs.get_mut(handle)?;
        if dir.pos >= dir.entries.len() {
            return Err(Error::Eof);
        }

        let pos = dir.pos;
        let batch = dirlist::batch(&dir.entries, pos, count);
        dir.pos += batch.entries.len();
        Ok(Reply::Entries {
            status: batch.status,
            pos: pos.min(u16::MAX as usize) as u16,
            entries: batch.entries,
        })
    }

    fn ropen(&self, session: &mut HostSession, flags: OpenFlags, mode: u16, path: &str) -> Result<Reply> {
        let file = open_options(flags, mode)?.open(session.path(path))?;
        if file.metadata()?.is_dir() {
            return Err(Error::No(EISDIR));
        }

        let fd = session.files.insert(file)?;
        Ok(Reply::Handle(fd))
    }

    fn rread(&self, session: &mut HostSession, fd: u8, size: u16) -> Result<Reply> {
        let file = session.files.get_mut(fd)?;

        let mut buf = vec![0; (size as usize).min(MAX_IOSZ)];
        let bytes = file.read(&mut buf[..])?;
        if bytes == 0 && !buf.is_empty() {
            return Err(Error::Eof);
        }
        buf.truncate(bytes);
        Ok(Reply::Data(buf))
    }

    fn rwrite(&self, session: &mut HostSession, fd: u8, data: &[u8]) -> Result<Reply> {
        if data.len() > MAX_IOSZ {
            return Err(Error::No(EINVAL));
        }
        let file = session.files.get_mut(fd)?;
        let count = file.write(data)?;
        Ok(Reply::Count(count as u16))
    }

    fn rclose(&self, session: &mut HostSession, fd: u8) -> Result<Reply> {
        session.files.remove(fd)?;
        Ok(Reply::Ok)
    }

    fn rstat(&self, session: &mut HostSession, path: &str) -> Result<Reply> {
        let attr = fs::metadata(session.path(path))?;
        Ok(Reply::Stat(stat_from_attr(&attr)))
    }

    fn rseek(&self, session: &mut HostSession, fd: u8, whence: Whence, offset: i32) -> Result<Reply> {
        let file = session.files.get_mut(fd)?;
        let from = match whence {
            Whence::Set if offset < 0 => return Err(Error::No(EINVAL)),
            Whence::Set => SeekFrom::Start(offset as u64),
            Whence::Cur => SeekFrom::Current(i64::from(offset)),
            Whence::End => SeekFrom::End(i64::from(offset)),
        };
        let pos = file.seek(from)?;
        Ok(Reply::Position(u32::try_from(pos).map_err(|_| Error::No(EFBIG))?))
    }

    fn runlink(&self, session: &mut HostSession, path: &str) -> Result<Reply> {
        fs::remove_file(session.child(path)?)?;
        Ok(Reply::Ok)
    }

    fn rchmod(&self, session: &mut HostSession, mode: u16, path: &str) -> Result<Reply> {
        fs::set_permissions(session.path(path), PermissionsExt::from_mode(u32::from(mode)))?;
        Ok(Reply::Ok)
    }

    fn rrename(&self, session: &mut HostSession, from: &str, to: &str) -> Result<Reply> {
        fs::rename(session.child(from)?, session.child(to)?)?;
        Ok(Reply::Ok)
    }
}
