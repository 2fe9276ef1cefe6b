//! Target set scanning and content fingerprints.
//!
//! A scan walks every target root (without following symlinks), drops
//! excluded paths, and fingerprints what remains. Fingerprints are keyed by
//! the archive member name: the absolute path with its leading `/` removed.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ArchiveError, ArchiveResult, io_err};

/// Kind of filesystem entry captured in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Content identity of one entry. Two scans producing equal fingerprints
/// for a path mean the entry did not change between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// The set of roots to archive plus the exclusion globs applied to them.
#[derive(Debug, Clone)]
pub struct TargetSet {
    roots: Vec<PathBuf>,
    excludes: Vec<Pattern>,
    allow_absent: bool,
}

/// Result of scanning a [`TargetSet`].
#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub entries: BTreeMap<String, Fingerprint>,
    /// Roots that did not exist at scan time (only with `allow_absent`).
    pub absent: Vec<String>,
}

impl Scan {
    /// Bytes of regular-file content among the given member names.
    pub fn content_bytes<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> u64 {
        names
            .into_iter()
            .filter_map(|n| self.entries.get(n))
            .filter(|fp| fp.kind == EntryKind::File)
            .map(|fp| fp.size)
            .sum()
    }
}

impl TargetSet {
    /// Build a target set. Roots must be absolute; patterns must be valid globs.
    pub fn new(roots: &[PathBuf], excludes: &[String]) -> ArchiveResult<Self> {
        if roots.is_empty() {
            return Err(ArchiveError::Config("no target paths given".to_string()));
        }
        for root in roots {
            if !root.is_absolute() {
                return Err(ArchiveError::Config(format!(
                    "target {} is not absolute",
                    root.display()
                )));
            }
            member_name(root)?;
        }
        let excludes = excludes
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    ArchiveError::Config(format!("invalid exclude pattern {p:?}: {e}"))
                })
            })
            .collect::<ArchiveResult<Vec<_>>>()?;
        let mut roots = roots.to_vec();
        roots.sort();
        roots.dedup();
        Ok(Self {
            roots,
            excludes,
            allow_absent: false,
        })
    }

    /// Record missing roots instead of failing. Used for rollback points,
    /// where a unit file may legitimately not exist yet.
    pub fn allow_absent(mut self) -> Self {
        self.allow_absent = true;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Member names of the roots, in sorted order.
    pub fn root_names(&self) -> Vec<String> {
        self.roots
            .iter()
            .filter_map(|r| member_name(r).ok())
            .collect()
    }

    fn is_excluded(&self, root: &Path, path: &Path) -> bool {
        if self.excludes.is_empty() || path == root {
            return false;
        }
        let rel = path.strip_prefix(root).unwrap_or(path);
        let name = path.file_name().map(Path::new);
        self.excludes.iter().any(|p| {
            p.matches_path(path) || p.matches_path(rel) || name.is_some_and(|n| p.matches_path(n))
        })
    }

    /// Walk and fingerprint every non-excluded entry under the roots.
    pub fn scan(&self) -> ArchiveResult<Scan> {
        let mut scan = Scan::default();
        for root in &self.roots {
            if fs::symlink_metadata(root).is_err() {
                if self.allow_absent {
                    debug!(root = %root.display(), "target absent, recorded for removal on restore");
                    scan.absent.push(member_name(root)?);
                    continue;
                }
                return Err(ArchiveError::MissingTarget(root.clone()));
            }

            let walker = WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !self.is_excluded(root, e.path()));
            for entry in walker {
                let entry = entry.map_err(|e| {
                    let context = format!("failed to walk {}", root.display());
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop"));
                    ArchiveError::Io { context, source }
                })?;
                let path = entry.path();
                let name = match member_name(path) {
                    Ok(name) => name,
                    Err(_) => {
                        debug!(path = %path.display(), "skipping non UTF-8 path");
                        continue;
                    }
                };
                if let Some(fp) = fingerprint(path)? {
                    scan.entries.insert(name, fp);
                }
            }
        }
        debug!(
            entries = scan.entries.len(),
            absent = scan.absent.len(),
            "target scan complete"
        );
        Ok(scan)
    }
}

/// Fingerprint a single path. Sockets, fifos and devices are skipped.
pub fn fingerprint(path: &Path) -> ArchiveResult<Option<Fingerprint>> {
    let meta = fs::symlink_metadata(path)
        .map_err(io_err(format!("failed to stat {}", path.display())))?;
    let ft = meta.file_type();
    let mode = file_mode(&meta);
    let fp = if ft.is_file() {
        let mut file =
            File::open(path).map_err(io_err(format!("failed to open {}", path.display())))?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)
            .map_err(io_err(format!("failed to read {}", path.display())))?;
        Fingerprint {
            kind: EntryKind::File,
            size,
            mode,
            sha256: Some(hex::encode(hasher.finalize())),
            link: None,
        }
    } else if ft.is_dir() {
        Fingerprint {
            kind: EntryKind::Dir,
            size: 0,
            mode,
            sha256: None,
            link: None,
        }
    } else if ft.is_symlink() {
        let target = fs::read_link(path)
            .map_err(io_err(format!("failed to read link {}", path.display())))?;
        Fingerprint {
            kind: EntryKind::Symlink,
            size: 0,
            mode: 0o777,
            sha256: None,
            link: Some(target.to_string_lossy().into_owned()),
        }
    } else {
        debug!(path = %path.display(), "skipping special file");
        return Ok(None);
    };
    Ok(Some(fp))
}

/// Archive member name for an absolute path.
pub fn member_name(path: &Path) -> ArchiveResult<String> {
    let rel = path
        .strip_prefix("/")
        .map_err(|_| ArchiveError::Config(format!("{} is not absolute", path.display())))?;
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(ArchiveError::Config(format!(
            "{} must not contain relative components",
            path.display()
        )));
    }
    rel.to_str()
        .map(str::to_string)
        .ok_or_else(|| ArchiveError::Config(format!("{} is not UTF-8", path.display())))
}

/// Resolve a member name back to a path under `base`, rejecting escapes.
pub fn member_path(base: &Path, name: &str) -> ArchiveResult<PathBuf> {
    let rel = Path::new(name);
    if name.is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(ArchiveError::Config(format!("unsafe archive member {name:?}")));
    }
    Ok(base.join(rel))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("cache")).unwrap();
        fs::write(root.join("bin/capture"), b"binary").unwrap();
        fs::write(root.join("app.log"), b"noise").unwrap();
        fs::write(root.join("cache/frame.raw"), b"frame").unwrap();
        fs::write(root.join("settings.toml"), b"fps = 24").unwrap();
        dir
    }

    #[test]
    fn scan_fingerprints_files_and_dirs() {
        let dir = tree();
        let root = dir.path().join("app");
        let set = TargetSet::new(&[root.clone()], &[]).unwrap();
        let scan = set.scan().unwrap();

        let bin = member_name(&root.join("bin/capture")).unwrap();
        let fp = &scan.entries[&bin];
        assert_eq!(fp.kind, EntryKind::File);
        assert_eq!(fp.size, 6);
        assert!(fp.sha256.is_some());
        assert_eq!(
            scan.entries[&member_name(&root).unwrap()].kind,
            EntryKind::Dir
        );
    }

    #[test]
    fn excludes_match_names_and_prune_directories() {
        let dir = tree();
        let root = dir.path().join("app");
        let set = TargetSet::new(&[root.clone()], &["*.log".into(), "cache".into()]).unwrap();
        let scan = set.scan().unwrap();

        let names: Vec<_> = scan.entries.keys().cloned().collect();
        assert!(!names.iter().any(|n| n.ends_with("app.log")));
        assert!(!names.iter().any(|n| n.contains("cache")));
        assert!(names.iter().any(|n| n.ends_with("settings.toml")));
    }

    #[test]
    fn missing_target_is_an_error_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.service");

        let set = TargetSet::new(&[missing.clone()], &[]).unwrap();
        assert!(matches!(set.scan(), Err(ArchiveError::MissingTarget(_))));

        let scan = set.allow_absent().scan().unwrap();
        assert_eq!(scan.absent, vec![member_name(&missing).unwrap()]);
        assert!(scan.entries.is_empty());
    }

    #[test]
    fn relative_roots_and_bad_globs_are_config_errors() {
        assert!(matches!(
            TargetSet::new(&[PathBuf::from("rel")], &[]),
            Err(ArchiveError::Config(_))
        ));
        assert!(matches!(
            TargetSet::new(&[PathBuf::from("/data")], &["[".into()]),
            Err(ArchiveError::Config(_))
        ));
    }

    #[test]
    fn member_path_rejects_escapes() {
        assert!(member_path(Path::new("/restore"), "../etc/passwd").is_err());
        assert!(member_path(Path::new("/restore"), "").is_err());
        assert_eq!(
            member_path(Path::new("/restore"), "data/a/x").unwrap(),
            PathBuf::from("/restore/data/a/x")
        );
    }

    #[test]
    fn content_change_changes_fingerprint() {
        let dir = tree();
        let file = dir.path().join("app/settings.toml");
        let before = fingerprint(&file).unwrap().unwrap();
        fs::write(&file, b"fps = 25").unwrap();
        let after = fingerprint(&file).unwrap().unwrap();
        assert_eq!(before.size, after.size);
        assert_ne!(before, after);
    }
}
