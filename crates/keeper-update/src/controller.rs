//! The update transaction: precheck, snapshot, stop, apply, restart, verify,
//! and roll back when any mutating step fails.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use keeper_archive::space::ensure_space;
use keeper_archive::{ArchiveError, FsSpace, SpaceProbe, TargetLock, sweep_partials};
use keeper_core::{KeeperConfig, PathsConfig};
use keeper_health::{
    HealthCheck, HttpHealthCheck, ProbePolicy, ProcessSupervisor, SystemctlSupervisor,
    wait_until_healthy,
};
use keeper_release::{AssetRole, ReleaseCandidate, ReleaseError, StagingArea};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::apply::{apply_release, run_hook};
use crate::error::{UpdateError, UpdateResult};
use crate::rollback::RollbackPoint;
use crate::state::{StatusStore, TxState, TxStatus};

/// Unpacked payloads are assumed to need at most this multiple of their
/// staged size.
const UNPACK_FACTOR: u64 = 3;

/// Update settings resolved from [`KeeperConfig`].
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub paths: PathsConfig,
    pub install_dir: PathBuf,
    pub unit_dir: PathBuf,
    pub units: Vec<String>,
    pub probe: ProbePolicy,
    pub history_keep: usize,
    pub reserve_bytes: u64,
}

impl UpdateSettings {
    pub fn from_config(cfg: &KeeperConfig) -> UpdateResult<Self> {
        let update = cfg
            .update
            .as_ref()
            .ok_or_else(|| UpdateError::Config("no [update] section configured".to_string()))?;
        if update.units.is_empty() {
            return Err(UpdateError::Config(
                "update.units must name at least one managed unit".to_string(),
            ));
        }
        let probe = ProbePolicy::from_config(&update.health)
            .map_err(|e| UpdateError::Config(e.to_string()))?;
        Ok(Self {
            paths: cfg.paths.clone(),
            install_dir: update.install_dir.clone(),
            unit_dir: update.unit_dir.clone(),
            units: update.units.clone(),
            probe,
            history_keep: update.history_keep.max(1),
            reserve_bytes: update.reserve_bytes,
        })
    }
}

/// How a transaction that got past the snapshot ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TxOutcome {
    Committed {
        version: String,
    },
    /// The release was rejected and the previous install is back in place.
    #[serde(rename_all = "camelCase")]
    RolledBack {
        version: String,
        failed_stage: TxState,
        reason: String,
    },
}

type StepResult<T> = Result<T, (TxState, UpdateError)>;

/// Tag an error with the transaction step it happened in.
fn at(stage: TxState) -> impl FnOnce(UpdateError) -> (TxState, UpdateError) {
    move |e| (stage, e)
}

fn task_err(e: tokio::task::JoinError) -> UpdateError {
    UpdateError::Task(e.to_string())
}

/// Runs update transactions against one install tree.
///
/// At most one transaction runs per controller, and the advisory lock keeps
/// backups and other processes out for its whole duration.
pub struct ApplyRollbackController {
    settings: UpdateSettings,
    staging: StagingArea,
    supervisor: Arc<dyn ProcessSupervisor>,
    health: Arc<dyn HealthCheck>,
    space: Arc<dyn SpaceProbe>,
    in_flight: tokio::sync::Mutex<()>,
    status: Mutex<TxStatus>,
    store: StatusStore,
}

impl ApplyRollbackController {
    pub fn new(
        settings: UpdateSettings,
        supervisor: Arc<dyn ProcessSupervisor>,
        health: Arc<dyn HealthCheck>,
    ) -> Self {
        let store = StatusStore::new(settings.paths.status_path());
        let status = settle_interrupted(store.load().unwrap_or_default(), &settings);
        Self {
            staging: StagingArea::new(&settings.paths.staging_dir),
            settings,
            supervisor,
            health,
            space: Arc::new(FsSpace),
            in_flight: tokio::sync::Mutex::new(()),
            status: Mutex::new(status),
            store,
        }
    }

    /// Controller using `systemctl` and the configured HTTP probe.
    pub fn from_config(cfg: &KeeperConfig) -> UpdateResult<Self> {
        let settings = UpdateSettings::from_config(cfg)?;
        let update = cfg
            .update
            .as_ref()
            .ok_or_else(|| UpdateError::Config("no [update] section configured".to_string()))?;
        Ok(Self::new(
            settings,
            Arc::new(SystemctlSupervisor::new(&update.systemctl)),
            Arc::new(HttpHealthCheck::from_config(&update.health)),
        ))
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    pub fn status(&self) -> TxStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut TxStatus)) {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut status);
            status.updated_at = Utc::now();
            status.clone()
        };
        if let Err(e) = self.store.persist(&snapshot) {
            warn!(error = %e, "failed to mirror update status");
        }
    }

    fn reload_status(&self) {
        if let Some(disk) = self.store.load() {
            let disk = settle_interrupted(disk, &self.settings);
            *self.status.lock().unwrap_or_else(PoisonError::into_inner) = disk;
        }
    }

    fn transition(&self, next: TxState) {
        self.update_status(|status| {
            if !status.state.can_transition_to(next) {
                warn!(from = %status.state, to = %next, "unexpected transaction transition");
            }
            status.state = next;
        });
        debug!(state = %next, "transaction state");
    }

    /// Run one transaction for the newest Ready release in staging.
    ///
    /// Failures before anything is stopped return [`UpdateError::Aborted`].
    /// A failure after that is rolled back and reported as
    /// [`TxOutcome::RolledBack`]; only a failed rollback is an error
    /// ([`UpdateError::Critical`]).
    pub async fn trigger(&self) -> UpdateResult<TxOutcome> {
        let _in_flight = self.in_flight.try_lock().map_err(|_| UpdateError::Busy)?;
        let _lock = TargetLock::try_acquire(&self.settings.paths.lock_path()).map_err(|e| {
            match e {
                ArchiveError::Busy(_) => UpdateError::Busy,
                other => other.into(),
            }
        })?;

        // Another process may have run a transaction since this one started.
        self.reload_status();
        self.update_status(|status| {
            status.state = TxState::Precheck;
            status.version = None;
            status.last_error = None;
        });
        let candidate = match self.precheck().await {
            Ok(candidate) => candidate,
            Err(e) => return Err(self.abort(TxState::Precheck, e)),
        };
        let version = candidate.version.clone();
        info!(version = %version, "update transaction started");
        self.update_status(|status| status.version = Some(version.clone()));

        self.transition(TxState::Snapshotting);
        let point = match self.snapshot(&candidate).await {
            Ok(point) => point,
            Err(e) => return Err(self.abort(TxState::Snapshotting, e)),
        };
        let cleanup = Cleanup::new(CleanupWork {
            staging: self.staging.clone(),
            version: version.clone(),
            point: point.clone(),
            history_dir: self.settings.paths.history_dir.clone(),
            keep: self.settings.history_keep,
        });

        let result = match self.forward(&candidate).await {
            Ok(()) => {
                self.update_status(|status| {
                    status.state = TxState::Committed;
                    status.installed_version = Some(version.clone());
                });
                info!(version = %version, state = %TxState::Committed, "update committed");
                Ok(TxOutcome::Committed { version })
            }
            Err((stage, cause)) => self.roll_back(&point, version, stage, cause).await,
        };
        cleanup.finish().await;
        result
    }

    fn abort(&self, stage: TxState, cause: UpdateError) -> UpdateError {
        let reason = cause.to_string();
        warn!(stage = %stage, error = %reason, "update aborted before any change");
        self.update_status(|status| {
            status.state = TxState::Aborted;
            status.last_error = Some(reason.clone());
        });
        UpdateError::Aborted {
            stage,
            reason,
            class: cause.class(),
        }
    }

    fn critical(&self, reason: String) -> UpdateError {
        error!(error = %reason, state = %TxState::Failed, "rollback failed, manual intervention required");
        self.update_status(|status| {
            status.state = TxState::Failed;
            status.last_error = Some(reason.clone());
        });
        UpdateError::Critical(reason)
    }

    /// A Ready candidate whose staged files still hash correctly, and room
    /// for both the rollback point and the new tree.
    async fn precheck(&self) -> UpdateResult<ReleaseCandidate> {
        let staging = self.staging.clone();
        let settings = self.settings.clone();
        let space = self.space.clone();
        tokio::task::spawn_blocking(move || -> UpdateResult<ReleaseCandidate> {
            let candidate = staging
                .latest_ready()?
                .ok_or(ReleaseError::NotReady(None))?;
            staging.reverify(&candidate)?;

            let installed = tree_bytes(&settings.install_dir)
                + settings
                    .units
                    .iter()
                    .map(|u| tree_bytes(&settings.unit_dir.join(u)))
                    .sum::<u64>();
            ensure_space(
                space.as_ref(),
                &settings.paths.rollback_dir,
                installed,
                settings.reserve_bytes,
            )?;
            ensure_space(
                space.as_ref(),
                &settings.install_dir,
                candidate.staged_bytes().saturating_mul(UNPACK_FACTOR),
                settings.reserve_bytes,
            )?;
            debug!(version = %candidate.version, installed_bytes = installed, "precheck passed");
            Ok(candidate)
        })
        .await
        .map_err(task_err)?
    }

    /// Everything an apply may touch: the install tree, the managed unit
    /// files and any unit file the release brings.
    fn rollback_targets(&self, candidate: &ReleaseCandidate) -> Vec<PathBuf> {
        let mut targets = vec![self.settings.install_dir.clone()];
        targets.extend(self.settings.units.iter().map(|u| self.settings.unit_dir.join(u)));
        targets.extend(
            candidate
                .assets_with_role(AssetRole::Unit)
                .map(|a| self.settings.unit_dir.join(&a.name)),
        );
        targets
    }

    async fn snapshot(&self, candidate: &ReleaseCandidate) -> UpdateResult<RollbackPoint> {
        let dir = self.settings.paths.rollback_dir.clone();
        let targets = self.rollback_targets(candidate);
        let space = self.space.clone();
        let reserve = self.settings.reserve_bytes;
        tokio::task::spawn_blocking(move || -> UpdateResult<RollbackPoint> {
            sweep_partials(&dir)?;
            RollbackPoint::create(&dir, &targets, space, reserve)
        })
        .await
        .map_err(task_err)?
    }

    async fn forward(&self, candidate: &ReleaseCandidate) -> StepResult<()> {
        let units = &self.settings.units;

        self.transition(TxState::Stopping);
        for unit in units.iter().rev() {
            self.supervisor
                .stop(unit)
                .await
                .map_err(UpdateError::from)
                .map_err(at(TxState::Stopping))?;
        }

        self.transition(TxState::Applying);
        let release = candidate.clone();
        let install_dir = self.settings.install_dir.clone();
        let unit_dir = self.settings.unit_dir.clone();
        let report = tokio::task::spawn_blocking(move || {
            apply_release(&release, &install_dir, &unit_dir)
        })
        .await
        .map_err(|e| (TxState::Applying, task_err(e)))?
        .map_err(at(TxState::Applying))?;
        debug!(files = report.files, units = ?report.units, "payload in place");
        if let Some(hook) = candidate.hook() {
            run_hook(hook, &self.settings.install_dir, &candidate.version)
                .await
                .map_err(at(TxState::Applying))?;
        }
        self.supervisor
            .reload_units()
            .await
            .map_err(UpdateError::from)
            .map_err(at(TxState::Applying))?;

        self.transition(TxState::Restarting);
        self.start_all().await.map_err(at(TxState::Restarting))?;

        self.transition(TxState::Verifying);
        if !wait_until_healthy(self.health.as_ref(), self.settings.probe).await {
            return Err((
                TxState::Verifying,
                UpdateError::Unhealthy(self.settings.probe.timeout),
            ));
        }
        Ok(())
    }

    /// Start every unit in order, then confirm each reports active.
    async fn start_all(&self) -> UpdateResult<()> {
        for unit in &self.settings.units {
            self.supervisor.start(unit).await?;
        }
        for unit in &self.settings.units {
            if !self.supervisor.is_active(unit).await? {
                return Err(UpdateError::Inactive(unit.clone()));
            }
        }
        Ok(())
    }

    async fn roll_back(
        &self,
        point: &RollbackPoint,
        version: String,
        failed_stage: TxState,
        cause: UpdateError,
    ) -> UpdateResult<TxOutcome> {
        let reason = cause.to_string();
        warn!(stage = %failed_stage, version = %version, error = %reason, "update failed, rolling back");
        self.update_status(|status| {
            status.state = TxState::RollingBack;
            status.last_error = Some(reason.clone());
        });

        for unit in self.settings.units.iter().rev() {
            if let Err(e) = self.supervisor.stop(unit).await {
                warn!(unit = %unit, error = %e, "stop before restore failed, continuing");
            }
        }

        let restore_point = point.clone();
        let restored = tokio::task::spawn_blocking(move || restore_point.restore())
            .await
            .map_err(task_err)
            .and_then(|r| r);
        if let Err(e) = restored {
            return Err(self.critical(format!(
                "restoring {} failed: {e}",
                point.archive_path.display()
            )));
        }
        if let Err(e) = self.supervisor.reload_units().await {
            return Err(self.critical(format!("reloading units after restore failed: {e}")));
        }
        if let Err(e) = self.start_all().await {
            return Err(self.critical(format!("restarting after restore failed: {e}")));
        }

        let healthy = wait_until_healthy(self.health.as_ref(), self.settings.probe).await;
        let last_error = if healthy {
            reason.clone()
        } else {
            warn!("previous release restored but its health probe is failing");
            format!("{reason}; health probe still failing after rollback")
        };
        self.update_status(|status| {
            status.state = TxState::RolledBack;
            status.last_error = Some(last_error);
        });
        info!(version = %version, state = %TxState::RolledBack, "previous release restored");
        Ok(TxOutcome::RolledBack {
            version,
            failed_stage,
            reason,
        })
    }
}

/// A mirrored status left mid-transaction means that transaction never
/// finished; report it as failed.
fn settle_interrupted(mut status: TxStatus, settings: &UpdateSettings) -> TxStatus {
    if !status.state.is_terminal() {
        warn!(
            state = %status.state,
            rollback_dir = %settings.paths.rollback_dir.display(),
            "previous update was interrupted; its rollback point is left in place"
        );
        status.last_error = Some(format!("interrupted during {}", status.state));
        status.state = TxState::Failed;
    }
    status
}

/// Bytes of regular files under `path`; zero when it does not exist.
fn tree_bytes(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[derive(Debug, Clone)]
struct CleanupWork {
    staging: StagingArea,
    version: String,
    point: RollbackPoint,
    history_dir: PathBuf,
    keep: usize,
}

impl CleanupWork {
    fn run(&self) {
        if let Err(e) = self.staging.discard(&self.version) {
            warn!(version = %self.version, error = %e, "failed to discard staged release");
        }
        if let Err(e) = self.point.retire(&self.history_dir, self.keep) {
            warn!(
                archive = %self.point.archive_path.display(),
                error = %e,
                "failed to move rollback point to history"
            );
        }
    }
}

/// Discards staging and retires the rollback point once the transaction
/// ends, including when the transaction future is dropped midway.
struct Cleanup {
    work: Option<CleanupWork>,
}

impl Cleanup {
    fn new(work: CleanupWork) -> Self {
        Self { work: Some(work) }
    }

    async fn finish(mut self) {
        if let Some(work) = self.work.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || work.run()).await {
                warn!(error = %e, "transaction cleanup task failed");
            }
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            work.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_require_an_update_section() {
        let mut cfg = KeeperConfig::scaffold();
        cfg.update = None;
        assert!(matches!(
            UpdateSettings::from_config(&cfg),
            Err(UpdateError::Config(_))
        ));
    }

    #[test]
    fn rolled_back_outcome_serializes_with_stage() {
        let outcome = TxOutcome::RolledBack {
            version: "2.0.0".to_string(),
            failed_stage: TxState::Applying,
            reason: "hook failed".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rolledBack");
        assert_eq!(json["failedStage"], "applying");
    }

    #[test]
    fn tree_bytes_of_missing_path_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(tree_bytes(&dir.path().join("nope")), 0);
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        assert_eq!(tree_bytes(dir.path()), 3);
    }
}
