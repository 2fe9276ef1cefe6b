//! A complete scheduled backup: lock, archive, prune, transfer.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use keeper_core::{KeeperConfig, PathsConfig};
use serde::Serialize;
use tracing::{info, warn};

use crate::archiver::{ArchiveRecord, Archiver, sweep_partials};
use crate::chain::{self, BackupChain, RestoreReport};
use crate::error::{ArchiveError, ArchiveResult};
use crate::format::Destination;
use crate::lock::TargetLock;
use crate::retention::{self, PruneItem, PrunePlan, RetentionWindow};
use crate::scan::TargetSet;
use crate::space::{FsSpace, SpaceProbe};
use crate::state::SnapshotStateStore;
use crate::transfer::{RemoteTransfer, TransferLedger, TransferOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub record: ArchiveRecord,
    pub pruned: Vec<PruneItem>,
    pub transfer: TransferOutcome,
}

/// Backup settings resolved from [`KeeperConfig`] once, up front.
pub struct BackupJob {
    paths: PathsConfig,
    targets: TargetSet,
    window: RetentionWindow,
    reserve_bytes: u64,
    remote: Option<RemoteTransfer>,
    space: Arc<dyn SpaceProbe>,
}

impl BackupJob {
    pub fn from_config(cfg: &KeeperConfig) -> ArchiveResult<Self> {
        let targets = TargetSet::new(&cfg.backup.targets, &cfg.backup.excludes)?;
        let window = RetentionWindow::from_config(&cfg.backup.retention)?;
        let remote = cfg
            .backup
            .remote
            .as_ref()
            .map(|r| {
                RemoteTransfer::from_config(
                    r,
                    TransferLedger::new(cfg.paths.transfer_ledger_path()),
                )
            })
            .transpose()?;
        Ok(Self {
            paths: cfg.paths.clone(),
            targets,
            window,
            reserve_bytes: cfg.backup.reserve_bytes,
            remote,
            space: Arc::new(FsSpace),
        })
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    fn state_store(&self) -> SnapshotStateStore {
        SnapshotStateStore::new(self.paths.snapshot_state_path())
    }

    /// Run one backup. Retention and transfer problems are logged and
    /// reported; only archiving itself can fail the run.
    pub async fn run(&self, force_full: bool) -> ArchiveResult<BackupReport> {
        let _lock = TargetLock::try_acquire(&self.paths.lock_path())?;
        sweep_partials(&self.paths.backup_dir)?;

        let archiver = Archiver::new(&self.paths.backup_dir)
            .with_state(self.state_store())
            .with_space_probe(self.space.clone())
            .with_reserve(self.reserve_bytes);
        let targets = self.targets.clone();
        let record = tokio::task::spawn_blocking(move || archiver.run(&targets, force_full))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        let pruned = match self.prune_locked(false).await {
            Ok(plan) => plan.delete,
            Err(e) => {
                warn!(error = %e, "retention pass failed; archives kept");
                Vec::new()
            }
        };

        let transfer = match &self.remote {
            Some(remote) => remote.sync(&self.paths.backup_dir, Some(&record.name)).await,
            None => TransferOutcome::Skipped,
        };

        info!(
            archive = %record.name,
            kind = %record.kind,
            pruned = pruned.len(),
            "backup run complete"
        );
        Ok(BackupReport {
            record,
            pruned,
            transfer,
        })
    }

    /// Apply retention outside a backup run.
    pub async fn prune(&self, dry_run: bool) -> ArchiveResult<PrunePlan> {
        let _lock = TargetLock::try_acquire(&self.paths.lock_path())?;
        self.prune_locked(dry_run).await
    }

    async fn prune_locked(&self, dry_run: bool) -> ArchiveResult<PrunePlan> {
        let dir = self.paths.backup_dir.clone();
        let window = self.window;
        tokio::task::spawn_blocking(move || -> ArchiveResult<PrunePlan> {
            let backups = BackupChain::discover(&dir)?;
            let plan = retention::prune(&backups, &window, Utc::now());
            if !dry_run {
                retention::apply_plan(&plan)?;
            }
            Ok(plan)
        })
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
    }

    pub fn chain(&self) -> ArchiveResult<BackupChain> {
        BackupChain::discover(&self.paths.backup_dir)
    }

    /// Restore the chain ending at `upto`, in place or under `into`.
    pub async fn restore(&self, upto: &str, into: Option<PathBuf>) -> ArchiveResult<RestoreReport> {
        let _lock = TargetLock::try_acquire(&self.paths.lock_path())?;
        let dir = self.paths.backup_dir.clone();
        let upto = upto.to_string();
        let dest = into.map_or(Destination::InPlace, Destination::Under);
        tokio::task::spawn_blocking(move || -> ArchiveResult<RestoreReport> {
            let backups = BackupChain::discover(&dir)?;
            chain::restore(&backups, &upto, &dest)
        })
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
    }
}
