//! Cross-process exclusion for runs that touch the same target set.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult, io_err};

/// Advisory exclusive lock on a lock file. Released when dropped.
///
/// The lock file itself is never removed; deleting it while another
/// process waits on the old inode would let two runs proceed.
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: PathBuf,
}

impl TargetLock {
    /// Take the lock without blocking. Contention is reported as `Busy`.
    pub fn try_acquire(path: &Path) -> ArchiveResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(io_err(format!("failed to create {}", parent.display())))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err(format!("failed to open lock {}", path.display())))?;

        if let Err(e) = fs2::FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(ArchiveError::Busy(path.to_path_buf()));
            }
            return Err(io_err(format!("failed to lock {}", path.display()))(e));
        }

        // Best effort: the pid helps an operator find the holder.
        let _ = file.set_len(0);
        let _ = file.seek(SeekFrom::Start(0));
        let _ = writeln!(file, "{}", std::process::id());
        debug!(lock = %path.display(), "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        debug!(lock = %self.path.display(), "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_busy_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keeper.lock");

        let first = TargetLock::try_acquire(&path).unwrap();
        assert!(matches!(
            TargetLock::try_acquire(&path),
            Err(ArchiveError::Busy(_))
        ));
        drop(first);
        assert!(TargetLock::try_acquire(&path).is_ok());
    }
}
