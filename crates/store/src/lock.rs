//! Store directory locking.
//!
//! One process owns a store directory at a time. A `.lock` file inside the
//! directory carries an OS-level exclusive lock (`flock` on Unix,
//! `LockFileEx` on Windows) that the kernel releases even if the process
//! crashes.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

/// An exclusive lock on a store directory, released on drop.
pub(crate) struct DirLock {
    /// Kept open to maintain the lock.
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquires the lock, non-blocking.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let lock_path = dir.join(".lock");
        let file = File::create(&lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %lock_path.display(), "acquired store directory lock");
                Ok(Self { file, path: lock_path })
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(11)
                    || e.raw_os_error() == Some(35) =>
            {
                Err(Error::AlreadyLocked { path: dir.to_path_buf() })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if FileExt::unlock(&self.file).is_ok() {
            debug!(path = %self.path.display(), "released store directory lock");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_exclusive_within_process() {
        let dir = tempdir().unwrap();

        let lock = DirLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            DirLock::acquire(dir.path()),
            Err(Error::AlreadyLocked { .. })
        ));

        drop(lock);
        DirLock::acquire(dir.path()).unwrap();
    }
}
