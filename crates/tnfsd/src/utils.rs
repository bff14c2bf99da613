use {
    nix::unistd::{Gid, Group, Uid, User},
    std::{
        fs::Metadata,
        os::unix::prelude::*,
        path::{Path, PathBuf},
    },
    tnfs::{DirEntry, EntryFlags, Stat},
};

#[macro_export]
macro_rules! INVALID_HANDLE {
    () => {
        tnfs::Error::No(tnfs::errno::EBADF)
    };
}

/// Resolve a client path beneath `root`.
///
/// Resolution is lexical: empty and `.` components are skipped and `..` removes the
/// previous component but never climbs above `root`.
pub fn resolve(root: &Path, path: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    resolved
}

/// Clamp a host quantity into a 32-bit protocol field
pub fn clamp_u32<T: TryInto<u32>>(value: T) -> u32 {
    value.try_into().unwrap_or(u32::MAX)
}

fn timestamp(secs: i64) -> u32 {
    clamp_u32(secs.max(0))
}

pub fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

pub fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

pub fn stat_from_attr(attr: &Metadata) -> Stat {
    Stat {
        mode: attr.mode() as u16,
        uid: attr.uid() as u16,
        gid: attr.gid() as u16,
        size: clamp_u32(attr.size()),
        atime: timestamp(attr.atime()),
        mtime: timestamp(attr.mtime()),
        ctime: timestamp(attr.ctime()),
        uid_name: user_name(attr.uid()),
        gid_name: group_name(attr.gid()),
    }
}

pub fn entry_flags(name: &str, attr: &Metadata) -> EntryFlags {
    let mut flags = EntryFlags::empty();
    if attr.is_dir() {
        flags |= EntryFlags::DIR;
    } else if !attr.is_file() {
        flags |= EntryFlags::SPECIAL;
    }
    if name.starts_with('.') {
        flags |= EntryFlags::HIDDEN;
    }
    flags
}

pub fn dirent_from_attr(name: String, attr: &Metadata) -> DirEntry {
    DirEntry {
        flags: entry_flags(&name, attr),
        size: clamp_u32(attr.size()),
        mtime: timestamp(attr.mtime()),
        ctime: timestamp(attr.ctime()),
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_stays_below_root() {
        let root = Path::new("/srv/tnfs");
        assert_eq!(resolve(root, "/"), PathBuf::from("/srv/tnfs"));
        assert_eq!(resolve(root, ""), PathBuf::from("/srv/tnfs"));
        assert_eq!(resolve(root, "games/a.xex"), PathBuf::from("/srv/tnfs/games/a.xex"));
        assert_eq!(resolve(root, "/games//./b/"), PathBuf::from("/srv/tnfs/games/b"));
        assert_eq!(resolve(root, "/games/../c"), PathBuf::from("/srv/tnfs/c"));
        assert_eq!(resolve(root, "../../etc/passwd"), PathBuf::from("/srv/tnfs/etc/passwd"));
        assert_eq!(resolve(root, "/a/../../.."), PathBuf::from("/srv/tnfs"));
    }

    #[test]
    fn clamping() {
        assert_eq!(clamp_u32(5u64), 5);
        assert_eq!(clamp_u32(u64::MAX), u32::MAX);
        assert_eq!(timestamp(-10), 0);
    }
}
