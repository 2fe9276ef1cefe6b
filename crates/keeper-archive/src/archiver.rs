//! The archiver: scan, decide full or incremental, write, verify, publish.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, ArchiveResult, io_err};
use crate::format::{
    self, ArchiveKind, FORMAT_VERSION, Manifest, archive_name, checksum_path, write_checksum,
};
use crate::scan::{Fingerprint, TargetSet};
use crate::space::{FsSpace, SpaceProbe, ensure_space};
use crate::state::{SnapshotState, SnapshotStateStore};

/// Tar header overhead charged per member in the space estimate.
const PER_ENTRY_OVERHEAD: u64 = 1024;

/// A published, verified archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub path: PathBuf,
    pub name: String,
    pub kind: ArchiveKind,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    pub size_bytes: u64,
    pub parent: Option<String>,
    pub chain_root: String,
    pub changed_entries: usize,
    pub deleted_entries: usize,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    CrashBeforePublish,
    CorruptBeforeVerify,
}

/// Produces archives into one destination directory.
pub struct Archiver {
    dest_dir: PathBuf,
    state: Option<SnapshotStateStore>,
    space: Arc<dyn SpaceProbe>,
    reserve_bytes: u64,
    #[cfg(test)]
    fault: Option<Fault>,
}

impl Archiver {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            state: None,
            space: Arc::new(FsSpace),
            reserve_bytes: 0,
            #[cfg(test)]
            fault: None,
        }
    }

    /// Track a snapshot state so runs can be incremental. Without one every
    /// run produces a `full` archive.
    pub fn with_state(mut self, store: SnapshotStateStore) -> Self {
        self.state = Some(store);
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn with_reserve(mut self, bytes: u64) -> Self {
        self.reserve_bytes = bytes;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Produce one archive of `targets`.
    ///
    /// `force_full` ignores any stored basis. Nothing is created when the
    /// space check fails, and the snapshot state is only replaced after the
    /// archive has been verified and renamed into place.
    pub fn run(&self, targets: &TargetSet, force_full: bool) -> ArchiveResult<ArchiveRecord> {
        let basis = if force_full { None } else { self.usable_basis(targets) };
        let scan = targets.scan()?;

        let (kind, members, deleted) = match &basis {
            None => (
                ArchiveKind::Full,
                scan.entries.clone(),
                Vec::new(),
            ),
            Some(state) => {
                let changed: BTreeMap<String, Fingerprint> = scan
                    .entries
                    .iter()
                    .filter(|(name, fp)| state.entries.get(*name) != Some(*fp))
                    .map(|(name, fp)| (name.clone(), fp.clone()))
                    .collect();
                let deleted: Vec<String> = state
                    .entries
                    .keys()
                    .filter(|name| !scan.entries.contains_key(*name))
                    .cloned()
                    .collect();
                (ArchiveKind::Incremental, changed, deleted)
            }
        };

        let needed = scan.content_bytes(members.keys())
            + (members.len() as u64 + 1) * PER_ENTRY_OVERHEAD;
        ensure_space(self.space.as_ref(), &self.dest_dir, needed, self.reserve_bytes)?;

        fs::create_dir_all(&self.dest_dir)
            .map_err(io_err(format!("failed to create {}", self.dest_dir.display())))?;
        let (name, created_at) = self.unique_name(kind);
        let final_path = self.dest_dir.join(&name);
        let tmp_path = keeper_core::fsutil::temp_sibling(&final_path);

        let chain_root = basis
            .as_ref()
            .map(|s| s.chain_root.clone())
            .unwrap_or_else(|| name.clone());
        let manifest = Manifest {
            format: FORMAT_VERSION,
            kind,
            name: name.clone(),
            parent: basis.as_ref().map(|s| s.basis.clone()),
            chain_root: chain_root.clone(),
            created_at,
            targets: targets.root_names(),
            absent_targets: scan.absent.clone(),
            entries: members,
            deleted,
        };

        debug!(archive = %name, kind = %kind, members = manifest.entries.len(), "writing archive");
        if let Err(e) = format::write_archive(&tmp_path, &manifest) {
            discard(&tmp_path);
            return Err(e);
        }

        #[cfg(test)]
        match self.fault {
            Some(Fault::CrashBeforePublish) => return Err(ArchiveError::Interrupted),
            Some(Fault::CorruptBeforeVerify) => corrupt(&tmp_path),
            None => {}
        }

        if let Err(e) = format::verify_archive(&tmp_path, &manifest) {
            warn!(archive = %name, error = %e, "read-back failed, discarding archive");
            discard(&tmp_path);
            return Err(e);
        }

        let checksum = match keeper_core::fsutil::sha256_file(&tmp_path) {
            Ok(sum) => sum,
            Err(e) => {
                discard(&tmp_path);
                return Err(io_err(format!("failed to hash {}", tmp_path.display()))(e));
            }
        };
        let size_bytes = fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);

        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            discard(&tmp_path);
            return Err(io_err(format!("failed to publish {}", final_path.display()))(e));
        }
        keeper_core::fsutil::fsync_dir(&self.dest_dir).ok();
        write_checksum(&final_path, &checksum)?;

        if let Some(store) = &self.state {
            store.persist(&SnapshotState::after(&manifest, scan.entries))?;
        }

        let record = ArchiveRecord {
            path: final_path,
            name,
            kind,
            created_at,
            checksum,
            size_bytes,
            parent: manifest.parent,
            chain_root,
            changed_entries: manifest.entries.len(),
            deleted_entries: manifest.deleted.len(),
        };
        info!(
            archive = %record.name,
            kind = %record.kind,
            changed = record.changed_entries,
            deleted = record.deleted_entries,
            size = record.size_bytes,
            "archive published"
        );
        Ok(record)
    }

    /// The stored basis, if it still describes this target set and its
    /// archive is still on disk.
    fn usable_basis(&self, targets: &TargetSet) -> Option<SnapshotState> {
        let state = self.state.as_ref()?.load()?;
        if state.targets != targets.root_names() {
            info!("target set changed since last archive, taking a full archive");
            return None;
        }
        let basis_path = self.dest_dir.join(&state.basis);
        if !basis_path.is_file() || !checksum_path(&basis_path).is_file() {
            warn!(basis = %state.basis, "basis archive missing, taking a full archive");
            return None;
        }
        Some(state)
    }

    fn unique_name(&self, kind: ArchiveKind) -> (String, DateTime<Utc>) {
        let mut at = Utc::now();
        loop {
            let name = archive_name(kind, at);
            if !self.dest_dir.join(&name).exists() {
                return (name, at);
            }
            at += ChronoDuration::microseconds(1);
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temporary archive");
        }
    }
}

#[cfg(test)]
fn corrupt(path: &Path) {
    let mut bytes = fs::read(path).unwrap_or_default();
    let mid = bytes.len() / 2;
    for b in bytes.iter_mut().skip(mid).take(64) {
        *b ^= 0xff;
    }
    let _ = fs::write(path, bytes);
}

/// Remove temporaries left behind by an interrupted run: hidden `*.tmp`
/// files and `*.partial` entries directly inside `dir`.
pub fn sweep_partials(dir: &Path) -> ArchiveResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_err(format!("failed to list {}", dir.display()))(e)),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let leftover =
            (name.starts_with('.') && name.ends_with(".tmp")) || name.ends_with(".partial");
        if leftover {
            format::remove_path(&entry.path())?;
            debug!(path = %entry.path().display(), "removed leftover temporary");
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "swept leftovers from an interrupted run");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::FixedSpace;

    struct Fixture {
        _dir: tempfile::TempDir,
        data: PathBuf,
        backups: PathBuf,
        store: SnapshotStateStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("a")).unwrap();
        fs::create_dir_all(data.join("b")).unwrap();
        fs::write(data.join("a/x"), b"alpha").unwrap();
        fs::write(data.join("b/x"), b"bravo").unwrap();
        let backups = dir.path().join("backups");
        let store = SnapshotStateStore::new(dir.path().join("state/snapshot-state.json"));
        Fixture {
            data,
            backups,
            store,
            _dir: dir,
        }
    }

    /// File name to bytes for everything directly inside `dir`.
    fn contents(dir: &Path) -> std::collections::BTreeMap<String, Vec<u8>> {
        listing(dir)
            .into_iter()
            .map(|name| {
                let bytes = fs::read(dir.join(&name)).unwrap();
                (name, bytes)
            })
            .collect()
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|rd| {
                rd.flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn first_run_is_full_then_incremental() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.join("a"), fx.data.join("b")], &[]).unwrap();
        let archiver = Archiver::new(&fx.backups).with_state(fx.store.clone());

        let full = archiver.run(&targets, false).unwrap();
        assert_eq!(full.kind, ArchiveKind::Full);
        assert_eq!(full.parent, None);
        assert_eq!(full.chain_root, full.name);

        fs::write(fx.data.join("b/x"), b"bravo two").unwrap();
        let incr = archiver.run(&targets, false).unwrap();
        assert_eq!(incr.kind, ArchiveKind::Incremental);
        assert_eq!(incr.parent.as_deref(), Some(full.name.as_str()));
        assert_eq!(incr.chain_root, full.name);
        assert_eq!(incr.changed_entries, 1);

        let manifest = format::read_manifest(&incr.path).unwrap();
        let b_x = crate::scan::member_name(&fx.data.join("b/x")).unwrap();
        assert_eq!(manifest.entries.keys().collect::<Vec<_>>(), vec![&b_x]);
        assert_eq!(fx.store.load().unwrap().basis, incr.name);
    }

    #[test]
    fn deletions_are_recorded() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.clone()], &[]).unwrap();
        let archiver = Archiver::new(&fx.backups).with_state(fx.store.clone());
        archiver.run(&targets, false).unwrap();

        fs::remove_file(fx.data.join("a/x")).unwrap();
        let incr = archiver.run(&targets, false).unwrap();
        assert_eq!(incr.deleted_entries, 1);
        assert_eq!(incr.changed_entries, 0);
    }

    #[test]
    fn force_full_ignores_the_basis() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.clone()], &[]).unwrap();
        let archiver = Archiver::new(&fx.backups).with_state(fx.store.clone());
        let first = archiver.run(&targets, false).unwrap();
        let second = archiver.run(&targets, true).unwrap();
        assert_eq!(second.kind, ArchiveKind::Full);
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn insufficient_space_changes_nothing() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.clone()], &[]).unwrap();
        let archiver = Archiver::new(&fx.backups)
            .with_state(fx.store.clone())
            .with_space_probe(Arc::new(FixedSpace(10)));

        let err = archiver.run(&targets, false).unwrap_err();
        assert!(matches!(err, ArchiveError::InsufficientSpace { .. }));
        assert!(!fx.backups.exists());
        assert!(!fx.store.path().exists());
    }

    #[test]
    fn interrupted_run_leaves_state_and_chain_untouched() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.clone()], &[]).unwrap();
        let good = Archiver::new(&fx.backups).with_state(fx.store.clone());
        let full = good.run(&targets, false).unwrap();
        let state_before = fs::read(fx.store.path()).unwrap();
        let dir_before = contents(&fx.backups);

        fs::write(fx.data.join("a/x"), b"changed").unwrap();
        let crashing = Archiver::new(&fx.backups)
            .with_state(fx.store.clone())
            .with_fault(Fault::CrashBeforePublish);
        assert!(crashing.run(&targets, false).is_err());

        assert_eq!(fs::read(fx.store.path()).unwrap(), state_before);
        // The only trace of the crash is the hidden temp file the rename never reached.
        let mut dir_after = contents(&fx.backups);
        let leftovers: Vec<String> = dir_after
            .keys()
            .filter(|n| !dir_before.contains_key(*n))
            .cloned()
            .collect();
        assert_eq!(leftovers.len(), 1, "{leftovers:?}");
        assert!(leftovers[0].starts_with(".incremental_") && leftovers[0].ends_with(".archive.tmp"));
        dir_after.remove(&leftovers[0]);
        assert_eq!(dir_after, dir_before);
        assert_eq!(
            crate::chain::BackupChain::discover(&fx.backups).unwrap().records()[0].name,
            full.name
        );

        assert_eq!(sweep_partials(&fx.backups).unwrap(), 1);
        assert_eq!(contents(&fx.backups), dir_before);
        let next = good.run(&targets, false).unwrap();
        assert_eq!(next.parent.as_deref(), Some(full.name.as_str()));
    }

    #[test]
    fn corrupted_temp_archive_is_discarded() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.clone()], &[]).unwrap();
        let archiver = Archiver::new(&fx.backups)
            .with_state(fx.store.clone())
            .with_fault(Fault::CorruptBeforeVerify);

        let err = archiver.run(&targets, false).unwrap_err();
        assert!(matches!(err, ArchiveError::Integrity { .. }));
        assert!(listing(&fx.backups).is_empty());
        assert!(fx.store.load().is_none());
    }

    #[test]
    fn stateless_archiver_always_takes_fulls() {
        let fx = fixture();
        let targets = TargetSet::new(&[fx.data.clone()], &[]).unwrap();
        let archiver = Archiver::new(&fx.backups);
        assert_eq!(archiver.run(&targets, false).unwrap().kind, ArchiveKind::Full);
        assert_eq!(archiver.run(&targets, false).unwrap().kind, ArchiveKind::Full);
    }
}
