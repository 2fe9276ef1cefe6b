//! Rollback points: a verified full archive of everything an update touches.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keeper_archive::format::{checksum_path, parse_archive_name};
use keeper_archive::{
    Archiver, Destination, RestoreReport, SpaceProbe, TargetSet, restore_archive,
};
use tracing::{debug, info, warn};

use crate::error::{UpdateResult, io_err};

/// The pre-transaction state of the installed tree and unit definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPoint {
    pub archive_path: PathBuf,
    pub target_paths: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl RollbackPoint {
    /// Archive `targets` into `dir` and read the result back.
    ///
    /// Targets that do not exist yet are recorded so a restore removes them
    /// again.
    pub fn create(
        dir: &Path,
        targets: &[PathBuf],
        space: Arc<dyn SpaceProbe>,
        reserve_bytes: u64,
    ) -> UpdateResult<Self> {
        let set = TargetSet::new(targets, &[])?.allow_absent();
        let record = Archiver::new(dir)
            .with_space_probe(space)
            .with_reserve(reserve_bytes)
            .run(&set, true)?;
        info!(
            archive = %record.name,
            size_bytes = record.size_bytes,
            "rollback point created"
        );
        Ok(Self {
            archive_path: record.path,
            target_paths: set.roots().to_vec(),
            created_at: record.created_at,
        })
    }

    /// Put every target back exactly as it was archived.
    pub fn restore(&self) -> UpdateResult<RestoreReport> {
        let report = restore_archive(&self.archive_path, &Destination::InPlace)?;
        info!(
            archive = %self.archive_path.display(),
            written = report.written,
            removed = report.removed,
            "rollback point restored"
        );
        Ok(report)
    }

    /// Move the archive and its sidecar into `history_dir`, then keep only
    /// the newest `keep` points there.
    pub fn retire(&self, history_dir: &Path, keep: usize) -> UpdateResult<PathBuf> {
        fs::create_dir_all(history_dir)
            .map_err(io_err(format!("failed to create {}", history_dir.display())))?;
        let name = self
            .archive_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        let moved = history_dir.join(&name);
        move_file(&self.archive_path, &moved)?;
        let sidecar = checksum_path(&self.archive_path);
        if sidecar.exists() {
            move_file(&sidecar, &checksum_path(&moved))?;
        }
        keeper_core::fsutil::fsync_dir(history_dir).ok();
        debug!(to = %moved.display(), "rollback point retired");

        let dropped = prune_history(history_dir, keep)?;
        if dropped > 0 {
            info!(dropped, keep, "rollback history trimmed");
        }
        Ok(moved)
    }
}

/// Rename, falling back to copy and remove across filesystems.
fn move_file(from: &Path, to: &Path) -> UpdateResult<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            let tmp = keeper_core::fsutil::temp_sibling(to);
            fs::copy(from, &tmp)
                .map_err(io_err(format!("failed to copy {}", from.display())))?;
            fs::rename(&tmp, to).map_err(io_err(format!("failed to publish {}", to.display())))?;
            fs::remove_file(from).map_err(io_err(format!("failed to remove {}", from.display())))
        }
        Err(e) => Err(io_err(format!("failed to move {}", from.display()))(e)),
    }
}

/// Remove the oldest rollback archives beyond `keep`.
fn prune_history(history_dir: &Path, keep: usize) -> UpdateResult<usize> {
    let mut names: Vec<String> = fs::read_dir(history_dir)
        .map_err(io_err(format!("failed to list {}", history_dir.display())))?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| parse_archive_name(name).is_some())
        .collect();
    // Names embed a fixed-width UTC timestamp after the kind prefix.
    names.sort_by(|a, b| timestamp_part(a).cmp(timestamp_part(b)));

    let excess = names.len().saturating_sub(keep);
    for name in &names[..excess] {
        let path = history_dir.join(name);
        for victim in [checksum_path(&path), path] {
            if let Err(e) = fs::remove_file(&victim) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %victim.display(), error = %e, "failed to drop old rollback point");
                }
            }
        }
    }
    Ok(excess)
}

fn timestamp_part(name: &str) -> &str {
    name.split_once('_').map_or(name, |(_, rest)| rest)
}
