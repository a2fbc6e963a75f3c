//! Exclusive advisory lock on the buildroot base directory.
//!
//! The lock lives in `basedir/buildroot.lock`, opened append-create and
//! locked exclusively without blocking. Sibling controller processes
//! coordinate on the file's inode; the controller therefore never deletes
//! the lock file itself (cleaning the whole base directory is a different
//! matter — a stale handle is detected and re-acquired on the next lock
//! attempt).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{BuildrootError, Result};

pub const LOCK_FILE: &str = "buildroot.lock";

/// Held advisory lock; releasing it is dropping it.
pub struct BuildrootLock {
    flock: Flock<File>,
}

impl std::fmt::Debug for BuildrootLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildrootLock").finish_non_exhaustive()
    }
}

impl BuildrootLock {
    /// Try to take the exclusive lock for `basedir`.
    ///
    /// Returns `Ok(None)` when the lock file cannot be opened at all — the
    /// base directory may not exist yet, which early clean tolerates.
    /// Contention with another holder is the hard [`BuildrootError::Locked`]
    /// error.
    pub fn acquire(basedir: &Path) -> Result<Option<Self>> {
        let path = basedir.join(LOCK_FILE);
        let file = match OpenOptions::new().append(true).create(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "lock file not openable");
                return Ok(None);
            }
        };
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self { flock })),
            Err((_, Errno::EWOULDBLOCK)) => Err(BuildrootError::Locked),
            Err((_, errno)) => Err(BuildrootError::Io(std::io::Error::from_raw_os_error(
                errno as i32,
            ))),
        }
    }

    /// Whether this handle still locks the file currently at
    /// `basedir/buildroot.lock`.
    ///
    /// False after the base directory was removed out from under us (the
    /// held inode is unlinked); the caller then re-acquires on the fresh
    /// file.
    pub fn is_current(&self, basedir: &Path) -> bool {
        let held = match self.flock.metadata() {
            Ok(m) => m.ino(),
            Err(_) => return false,
        };
        match std::fs::metadata(basedir.join(LOCK_FILE)) {
            Ok(m) => m.ino() == held,
            Err(_) => false,
        }
    }
}
