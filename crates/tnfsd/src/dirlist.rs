//! Filtered and sorted directory listings for `OpenDirX`/`ReadDirX`.

use {
    crate::{glob::NamePattern, utils::dirent_from_attr},
    std::{cmp::Ordering, fs, io, path::Path},
    tnfs::{DirEntry, DirOptions, DirStatus, EntryFlags, MAX_PAYLOAD, READDIRX_HDRSZ, SortOptions},
};

/// Listing parameters of an `OpenDirX` request
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub options: DirOptions,
    pub sort: SortOptions,
    /// 0 = unlimited
    pub max_results: u16,
    /// Empty = no filtering
    pub pattern: String,
}

impl ListOptions {
    fn pattern(&self) -> Option<NamePattern> {
        (!self.pattern.is_empty()).then(|| NamePattern::new(&self.pattern, true))
    }

    fn keep(&self, entry: &DirEntry, pattern: Option<&NamePattern>) -> bool {
        let is_dir = entry.flags.contains(EntryFlags::DIR);

        if let Some(pattern) = pattern
            && (!is_dir || self.options.contains(DirOptions::DIR_PATTERN))
            && !pattern.matches(&entry.name)
        {
            return false;
        }
        if entry.flags.contains(EntryFlags::HIDDEN)
            && !self.options.contains(DirOptions::NO_SKIPHIDDEN)
        {
            return false;
        }
        if entry.flags.contains(EntryFlags::SPECIAL)
            && !self.options.contains(DirOptions::NO_SKIPSPECIAL)
        {
            return false;
        }
        !(is_dir && self.options.contains(DirOptions::NO_FOLDERS))
    }

    fn compare(&self, a: &DirEntry, b: &DirEntry) -> Ordering {
        let by_name = || {
            if self.sort.contains(SortOptions::CASE) {
                a.name.cmp(&b.name)
            } else {
                a.name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
                    .then_with(|| a.name.cmp(&b.name))
            }
        };

        let ord = if self.sort.contains(SortOptions::SIZE) {
            a.size.cmp(&b.size).then_with(by_name)
        } else if self.sort.contains(SortOptions::MODIFIED) {
            a.mtime.cmp(&b.mtime).then_with(by_name)
        } else {
            by_name()
        };

        if self.sort.contains(SortOptions::DESCENDING) {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// List the entries of `dir` which pass `opts`, directories first unless
/// `NO_FOLDERSFIRST` is set.
pub fn list(dir: &Path, opts: &ListOptions) -> io::Result<Vec<DirEntry>> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let folders_first = !opts.options.contains(DirOptions::NO_FOLDERSFIRST);
    let pattern = opts.pattern();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // a dangling symlink is still listed, as a special entry
        let attr = match fs::metadata(&path) {
            Ok(attr) => attr,
            Err(_) => fs::symlink_metadata(&path)?,
        };

        let dirent = dirent_from_attr(entry.file_name().to_string_lossy().into_owned(), &attr);
        if !opts.keep(&dirent, pattern.as_ref()) {
            continue;
        }

        if folders_first && dirent.flags.contains(EntryFlags::DIR) {
            dirs.push(dirent);
        } else {
            files.push(dirent);
        }

        if opts.max_results > 0 && dirs.len() + files.len() >= opts.max_results as usize {
            break;
        }
    }

    if !opts.sort.contains(SortOptions::NONE) {
        dirs.sort_by(|a, b| opts.compare(a, b));
        files.sort_by(|a, b| opts.compare(a, b));
    }
    dirs.append(&mut files);
    Ok(dirs)
}

/// A batch of entries for one `ReadDirX` response
#[derive(Debug, PartialEq, Eq)]
pub struct Batch {
    pub status: DirStatus,
    pub entries: Vec<DirEntry>,
}

/// Take up to `count` entries (0 = as many as fit) starting at `pos`, packed to fit
/// in a single message.
pub fn batch(entries: &[DirEntry], pos: usize, count: u8) -> Batch {
    let limit = match count {
        0 => usize::from(u8::MAX),
        n => usize::from(n),
    };

    let mut size = READDIRX_HDRSZ;
    let mut out = Vec::new();
    for entry in entries.iter().skip(pos) {
        if out.len() >= limit || size + entry.size() > MAX_PAYLOAD {
            break;
        }
        size += entry.size();
        out.push(entry.clone());
    }

    let status = if pos + out.len() >= entries.len() {
        DirStatus::EOF
    } else {
        DirStatus::empty()
    };
    Batch {
        status,
        entries: out,
    }
}
