//! A `statx`-based probe for whether a path is the root of its own
//! mount. [`crate::prepareroot`] uses it to refuse enabling fs-verity
//! enforcement on a filesystem that can't back it.

use std::os::fd::AsFd;
use std::path::Path;

use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;

use crate::error::CoreError;

// musl's libc bindings don't expose `STATX_ATTR_MOUNT_ROOT`.
#[cfg(target_env = "gnu")]
use libc::STATX_ATTR_MOUNT_ROOT;
#[cfg(target_env = "musl")]
const STATX_ATTR_MOUNT_ROOT: libc::c_int = 0x2000;

fn probe_mount_root(root: &Dir, path: &Path) -> Result<Option<bool>, CoreError> {
    use rustix::fs::{AtFlags, StatxFlags};

    // SAFETY(unwrap): infallible i32-to-u64 widening of a small constant.
    let mountroot_flag: u64 = STATX_ATTR_MOUNT_ROOT.try_into().unwrap();
    match rustix::fs::statx(
        root.as_fd(),
        path,
        AtFlags::NO_AUTOMOUNT | AtFlags::SYMLINK_NOFOLLOW,
        StatxFlags::empty(),
    ) {
        Ok(r) => {
            let attr_known = (r.stx_attributes_mask & mountroot_flag) > 0;
            Ok(attr_known.then_some(r.stx_attributes & mountroot_flag > 0))
        }
        Err(e) if e == rustix::io::Errno::NOSYS => Ok(None),
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// Whether `path`, relative to the directory capability `root`, is the
/// root of its own mount. `Ok(None)` means the running kernel doesn't
/// report the statx mount-root attribute at all; callers should treat
/// that as "unknown" rather than "no".
pub fn is_mountpoint(root: &Dir, path: impl AsRef<Path>) -> Result<Option<bool>, CoreError> {
    probe_mount_root(root, path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_tempfile;

    #[test]
    fn root_filesystem_is_its_own_mount() -> Result<(), CoreError> {
        let root = Dir::open_ambient_dir("/", cap_std::ambient_authority()).map_err(CoreError::from)?;
        match is_mountpoint(&root, Path::new("/"))? {
            Some(is_root) => assert!(is_root),
            // Host kernel doesn't support the statx attribute; nothing to assert.
            None => return Ok(()),
        }
        Ok(())
    }

    #[test]
    fn fresh_tempdir_is_not_a_mount_root() -> Result<(), CoreError> {
        let tmpdir = cap_tempfile::TempDir::new(cap_std::ambient_authority()).map_err(CoreError::from)?;
        if let Some(is_root) = is_mountpoint(&tmpdir, Path::new("."))? {
            assert!(!is_root);
        }
        Ok(())
    }
}
