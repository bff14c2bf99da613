//! Confinement of the daemon to its root directory.

use {
    log::{info, warn},
    nix::unistd::{Group, Uid, User, chdir, chroot, setgid, setuid},
    std::path::Path,
    tnfs::{Result, io_err, res},
};

/// Chroot into `root` and drop to `user` and `group`.
///
/// Both names are looked up before the chroot, while the host's user database is
/// still reachable.
pub fn jail(root: &Path, user: &str, group: &str) -> Result<()> {
    let Some(user) = User::from_name(user)? else {
        return res!(io_err!(NotFound, format!("no such user: {}", user)));
    };
    let Some(group) = Group::from_name(group)? else {
        return res!(io_err!(NotFound, format!("no such group: {}", group)));
    };

    chdir(root)?;
    chroot(root)?;
    chdir("/")?;

    // group first, setuid takes away the right to change it
    setgid(group.gid)?;
    setuid(user.uid)?;

    info!(
        "Jailed in {:?} as {}:{}",
        root, user.name, group.name
    );
    Ok(())
}

pub fn warn_if_root() {
    if Uid::effective().is_root() {
        warn!("Running as root; consider -u and -g to drop privileges");
    }
}
