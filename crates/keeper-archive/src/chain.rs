//! Backup chain discovery and point-in-time restore.
//!
//! Chains are reconstructed from the manifests stored inside each archive.
//! A record belongs to the chain of the full archive its parent links lead
//! back to; file names and timestamps are never used to infer lineage.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ArchiveError, ArchiveResult, io_err};
use crate::format::{self, ArchiveKind, Destination, checksum_path, parse_archive_name};

/// One archive as seen by discovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRecord {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArchiveKind,
    pub created_at: DateTime<Utc>,
    pub parent: Option<String>,
    pub chain_root: String,
    pub size_bytes: u64,
}

/// An archive that cannot be placed in a restorable chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphan {
    pub path: PathBuf,
    pub reason: String,
}

/// All archives in a backup directory, split into linked records and orphans.
#[derive(Debug, Clone, Default)]
pub struct BackupChain {
    dir: PathBuf,
    records: Vec<ChainRecord>,
    orphans: Vec<Orphan>,
}

impl BackupChain {
    /// Read every conforming archive in `dir`. A missing directory is an
    /// empty chain.
    pub fn discover(dir: &Path) -> ArchiveResult<Self> {
        let mut chain = BackupChain {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(chain),
            Err(e) => return Err(io_err(format!("failed to list {}", dir.display()))(e)),
        };

        let mut candidates = Vec::new();
        for entry in listing.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(kind) = parse_archive_name(&name) else {
                continue;
            };
            let path = entry.path();
            if !checksum_path(&path).is_file() {
                chain.orphan(path, "no checksum sidecar");
                continue;
            }
            let manifest = match format::read_manifest(&path) {
                Ok(m) => m,
                Err(e) => {
                    chain.orphan(path, format!("no readable manifest: {e}"));
                    continue;
                }
            };
            if manifest.name != name || manifest.kind != kind {
                chain.orphan(path, "manifest does not match file name");
                continue;
            }
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            candidates.push(ChainRecord {
                name,
                path,
                kind,
                created_at: manifest.created_at,
                parent: manifest.parent,
                chain_root: manifest.chain_root,
                size_bytes,
            });
        }

        // Link: fulls are roots; an incremental is linked once its parent is.
        let mut linked: BTreeSet<String> = candidates
            .iter()
            .filter(|r| r.kind == ArchiveKind::Full && r.parent.is_none())
            .map(|r| r.name.clone())
            .collect();
        loop {
            let before = linked.len();
            for r in &candidates {
                if let Some(parent) = &r.parent {
                    if r.kind == ArchiveKind::Incremental && linked.contains(parent) {
                        linked.insert(r.name.clone());
                    }
                }
            }
            if linked.len() == before {
                break;
            }
        }

        for record in candidates {
            if linked.contains(&record.name) {
                chain.records.push(record);
            } else {
                let reason = format!(
                    "parent {} is missing",
                    record.parent.as_deref().unwrap_or("<none>")
                );
                chain.orphan(record.path, reason);
            }
        }
        chain
            .records
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        chain.orphans.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(chain)
    }

    /// Build a chain from already-linked records, e.g. a listing kept by a
    /// remote index.
    pub fn from_records(dir: impl Into<PathBuf>, mut records: Vec<ChainRecord>) -> Self {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Self {
            dir: dir.into(),
            records,
            orphans: Vec::new(),
        }
    }

    fn orphan(&mut self, path: PathBuf, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(archive = %path.display(), %reason, "archive cannot be linked into a chain");
        self.orphans.push(Orphan { path, reason });
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Linked records, oldest first.
    pub fn records(&self) -> &[ChainRecord] {
        &self.records
    }

    pub fn orphans(&self) -> &[Orphan] {
        &self.orphans
    }

    pub fn get(&self, name: &str) -> Option<&ChainRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn latest(&self) -> Option<&ChainRecord> {
        self.records.last()
    }

    /// Full records, newest first.
    pub fn fulls(&self) -> Vec<&ChainRecord> {
        let mut fulls: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.kind == ArchiveKind::Full)
            .collect();
        fulls.reverse();
        fulls
    }

    /// Records grouped by the full archive that roots them.
    pub fn chains(&self) -> BTreeMap<&str, Vec<&ChainRecord>> {
        let mut chains: BTreeMap<&str, Vec<&ChainRecord>> = BTreeMap::new();
        for r in &self.records {
            chains.entry(r.chain_root.as_str()).or_default().push(r);
        }
        chains
    }

    /// The full root and every incremental leading to `name`, in replay order.
    pub fn lineage(&self, name: &str) -> ArchiveResult<Vec<&ChainRecord>> {
        let mut lineage = Vec::new();
        let mut cursor = Some(name.to_string());
        while let Some(current) = cursor {
            let record = self
                .get(&current)
                .ok_or_else(|| ArchiveError::NotFound(current.clone()))?;
            if lineage.len() > self.records.len() {
                return Err(ArchiveError::integrity(&record.path, "parent links form a cycle"));
            }
            lineage.push(record);
            cursor = record.parent.clone();
        }
        lineage.reverse();
        Ok(lineage)
    }

    /// Every record whose parent links pass through `name`, excluding it,
    /// nearest first. Creation times may run backwards after a clock step,
    /// so only the links are followed.
    pub fn descendants(&self, name: &str) -> Vec<&ChainRecord> {
        let mut found: BTreeSet<&str> = BTreeSet::from([name]);
        let mut out = Vec::new();
        loop {
            let level: Vec<&ChainRecord> = self
                .records
                .iter()
                .filter(|r| !found.contains(r.name.as_str()))
                .filter(|r| r.parent.as_deref().is_some_and(|p| found.contains(p)))
                .collect();
            if level.is_empty() {
                break;
            }
            found.extend(level.iter().copied().map(|r| r.name.as_str()));
            out.extend(level);
        }
        out
    }

    /// Number of parent links between each record and its full root.
    pub fn depths(&self) -> BTreeMap<&str, usize> {
        let mut depths: BTreeMap<&str, usize> = self
            .records
            .iter()
            .filter(|r| r.parent.is_none())
            .map(|r| (r.name.as_str(), 0))
            .collect();
        loop {
            let before = depths.len();
            for r in &self.records {
                if depths.contains_key(r.name.as_str()) {
                    continue;
                }
                if let Some(parent) = r.parent.as_deref().and_then(|p| depths.get(p).copied()) {
                    depths.insert(r.name.as_str(), parent + 1);
                }
            }
            if depths.len() == before {
                break;
            }
        }
        depths
    }
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub applied: Vec<String>,
    pub written: usize,
    pub removed: usize,
}

/// Replay the chain ending at `upto` onto `dest`.
///
/// Every sidecar checksum in the lineage is verified before anything is
/// written, so a damaged chain fails without touching the destination.
pub fn restore(chain: &BackupChain, upto: &str, dest: &Destination) -> ArchiveResult<RestoreReport> {
    let lineage = chain.lineage(upto)?;
    for record in &lineage {
        format::verify_checksum(&record.path)?;
    }

    let mut report = RestoreReport::default();
    for (i, record) in lineage.iter().enumerate() {
        let (_, stats) = format::unpack_archive(&record.path, dest, i == 0)?;
        report.applied.push(record.name.clone());
        report.written += stats.written;
        report.removed += stats.removed;
    }
    info!(
        upto,
        archives = report.applied.len(),
        written = report.written,
        "restore complete"
    );
    Ok(report)
}

/// Restore a single full archive, replacing its targets entirely.
pub fn restore_archive(path: &Path, dest: &Destination) -> ArchiveResult<RestoreReport> {
    format::verify_checksum(path)?;
    if format::read_manifest(path)?.kind != ArchiveKind::Full {
        return Err(ArchiveError::integrity(
            path,
            "only a full archive can be restored on its own",
        ));
    }
    let (manifest, stats) = format::unpack_archive(path, dest, true)?;
    Ok(RestoreReport {
        applied: vec![manifest.name],
        written: stats.written,
        removed: stats.removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::Archiver;
    use crate::scan::TargetSet;
    use crate::state::SnapshotStateStore;

    #[test]
    fn discovery_links_by_manifest_and_flags_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("f"), b"1").unwrap();
        let backups = dir.path().join("backups");
        let store = SnapshotStateStore::new(dir.path().join("state.json"));
        let targets = TargetSet::new(&[data.clone()], &[]).unwrap();
        let archiver = Archiver::new(&backups).with_state(store);

        let full = archiver.run(&targets, false).unwrap();
        fs::write(data.join("f"), b"2").unwrap();
        let i1 = archiver.run(&targets, false).unwrap();
        fs::write(data.join("f"), b"3").unwrap();
        let i2 = archiver.run(&targets, false).unwrap();

        // An archive-looking file with no manifest.
        let junk = backups.join("full_20000101T000000000000Z.archive");
        fs::write(&junk, b"not an archive").unwrap();
        fs::write(checksum_path(&junk), b"x").unwrap();

        let chain = BackupChain::discover(&backups).unwrap();
        assert_eq!(chain.records().len(), 3);
        assert_eq!(chain.orphans().len(), 1);
        assert_eq!(chain.orphans()[0].path, junk);

        let lineage: Vec<_> = chain
            .lineage(&i2.name)
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(lineage, vec![full.name.clone(), i1.name.clone(), i2.name.clone()]);

        let desc: Vec<_> = chain.descendants(&i1.name).iter().map(|r| r.name.clone()).collect();
        assert_eq!(desc, vec![i2.name.clone()]);

        // Removing the middle link orphans everything after it.
        fs::remove_file(&i1.path).unwrap();
        let chain = BackupChain::discover(&backups).unwrap();
        assert_eq!(chain.records().len(), 1);
        assert!(chain.orphans().iter().any(|o| o.path == i2.path));
    }

    #[test]
    fn unknown_name_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let chain = BackupChain::discover(dir.path()).unwrap();
        assert!(matches!(
            chain.lineage("full_20000101T000000000000Z.archive"),
            Err(ArchiveError::NotFound(_))
        ));
    }
}
