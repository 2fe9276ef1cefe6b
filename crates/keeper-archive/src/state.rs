//! Persisted snapshot state: the fingerprint map of the last published
//! archive. The next incremental run diffs against it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ArchiveError, ArchiveResult, io_err};
use crate::format::{FORMAT_VERSION, Manifest};
use crate::scan::Fingerprint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotState {
    pub format: u32,
    /// Name of the archive this state was captured for.
    pub basis: String,
    pub chain_root: String,
    pub created_at: DateTime<Utc>,
    pub targets: Vec<String>,
    pub entries: BTreeMap<String, Fingerprint>,
}

impl SnapshotState {
    /// State after publishing an archive whose scan produced `entries`.
    pub fn after(manifest: &Manifest, entries: BTreeMap<String, Fingerprint>) -> Self {
        Self {
            format: FORMAT_VERSION,
            basis: manifest.name.clone(),
            chain_root: manifest.chain_root.clone(),
            created_at: manifest.created_at,
            targets: manifest.targets.clone(),
            entries,
        }
    }
}

/// File-backed store for [`SnapshotState`].
#[derive(Debug, Clone)]
pub struct SnapshotStateStore {
    path: PathBuf,
}

impl SnapshotStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, treating anything unreadable as "no basis".
    pub fn load(&self) -> Option<SnapshotState> {
        match self.load_strict() {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable snapshot state");
                None
            }
        }
    }

    pub fn load_strict(&self) -> ArchiveResult<Option<SnapshotState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(format!("failed to read {}", self.path.display()))(e)),
        };
        let state: SnapshotState = serde_json::from_slice(&bytes)
            .map_err(|e| ArchiveError::Serialize(format!("{}: {e}", self.path.display())))?;
        if state.format != FORMAT_VERSION {
            return Err(ArchiveError::Serialize(format!(
                "{}: unsupported format {}",
                self.path.display(),
                state.format
            )));
        }
        Ok(Some(state))
    }

    pub fn persist(&self, state: &SnapshotState) -> ArchiveResult<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| ArchiveError::Serialize(e.to_string()))?;
        keeper_core::fsutil::write_atomic(&self.path, &json)
            .map_err(io_err(format!("failed to write {}", self.path.display())))
    }

    /// Forget the basis so the next run is a full archive.
    pub fn reset(&self) -> ArchiveResult<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(io_err(format!("failed to remove {}", self.path.display()))(e))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotState {
        SnapshotState {
            format: FORMAT_VERSION,
            basis: "full_20261019T083005000000Z.archive".into(),
            chain_root: "full_20261019T083005000000Z.archive".into(),
            created_at: Utc::now(),
            targets: vec!["data/a".into()],
            entries: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_state_means_no_basis() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStateStore::new(dir.path().join("snapshot-state.json"));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStateStore::new(dir.path().join("snapshot-state.json"));
        let state = sample();
        store.persist(&state).unwrap();
        assert_eq!(store.load(), Some(state));
        store.reset().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn corrupt_state_is_ignored_but_reported_strictly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot-state.json");
        fs::write(&path, b"{not json").unwrap();
        let store = SnapshotStateStore::new(&path);
        assert_eq!(store.load(), None);
        assert!(store.load_strict().is_err());
    }
}
