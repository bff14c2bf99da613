//! Read-only mode gate.

use crate::proto::{OpenFlags, cmd};

/// Commands which modify the exported tree
const RW_CMDS: [u8; 6] = [
    cmd::MKDIR,
    cmd::RMDIR,
    cmd::WRITE,
    cmd::UNLINK,
    cmd::CHMOD,
    cmd::RENAME,
];

/// Open flags which can modify a file
const RW_FLAGS: OpenFlags = OpenFlags::WRONLY
    .union(OpenFlags::APPEND)
    .union(OpenFlags::CREAT)
    .union(OpenFlags::TRUNC)
    .union(OpenFlags::EXCL);

/// Decides whether an operation is permitted.
///
/// In read-write mode everything is. In read-only mode the mutating commands are
/// refused outright, and `Open` is refused when its flags ask for anything beyond
/// reading.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessGate {
    read_only: bool,
}

impl AccessGate {
    pub fn new(read_only: bool) -> AccessGate {
        AccessGate { read_only }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_cmd_allowed(&self, cmd: u8) -> bool {
        !self.read_only || !RW_CMDS.contains(&cmd)
    }

    pub fn is_open_allowed(&self, flags: OpenFlags) -> bool {
        !self.read_only || !flags.intersects(RW_FLAGS)
    }
}
