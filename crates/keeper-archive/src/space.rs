//! Free-space checks performed before anything is written.

use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, ArchiveResult, io_err};

/// Reports free bytes on the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> ArchiveResult<u64>;
}

/// Probe backed by `statvfs` through fs2.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpace;

impl SpaceProbe for FsSpace {
    fn available(&self, path: &Path) -> ArchiveResult<u64> {
        let existing = nearest_existing(path);
        fs2::available_space(&existing)
            .map_err(io_err(format!("failed to query free space at {}", existing.display())))
    }
}

/// Probe that always reports the same number. Lets tests simulate a full disk.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available(&self, _path: &Path) -> ArchiveResult<u64> {
        Ok(self.0)
    }
}

/// The closest ancestor of `path` that exists, so a destination that has
/// not been created yet can still be measured.
pub fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("/"),
        }
    }
}

/// Fail with `InsufficientSpace` unless `needed + reserve` bytes are free.
pub fn ensure_space(
    probe: &dyn SpaceProbe,
    path: &Path,
    needed: u64,
    reserve: u64,
) -> ArchiveResult<()> {
    let available = probe.available(path)?;
    let needed = needed.saturating_add(reserve);
    if available < needed {
        return Err(ArchiveError::InsufficientSpace {
            path: path.to_path_buf(),
            needed,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_existing_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c");
        assert_eq!(nearest_existing(&deep), dir.path());
    }

    #[test]
    fn reserve_counts_against_free_space() {
        let probe = FixedSpace(100);
        assert!(ensure_space(&probe, Path::new("/x"), 60, 40).is_ok());
        let err = ensure_space(&probe, Path::new("/x"), 60, 41).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::InsufficientSpace {
                needed: 101,
                available: 100,
                ..
            }
        ));
    }

    #[test]
    fn real_filesystem_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsSpace.available(&dir.path().join("missing")).unwrap() > 0);
    }
}
