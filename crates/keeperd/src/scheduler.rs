//! Periodic backup and release loops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keeper_archive::{ArchiveError, BackupChain, BackupJob, TransferOutcome};
use keeper_core::ErrorClass;
use keeper_release::descriptor::parse_version;
use keeper_release::{Channel, ReleaseFetcher};
use keeper_update::{ApplyRollbackController, StatusStore, TxOutcome, TxState, TxStatus, UpdateError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Time until the next backup is due, given when the newest one was made.
pub fn next_backup_delay(
    interval: Duration,
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let Some(latest) = latest else {
        return Duration::ZERO;
    };
    let age = (now - latest).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(age)
}

pub struct BackupLoop {
    job: Arc<BackupJob>,
    interval: Duration,
    backup_dir: PathBuf,
}

impl BackupLoop {
    pub fn new(job: Arc<BackupJob>, interval: Duration, backup_dir: PathBuf) -> Self {
        Self {
            job,
            interval,
            backup_dir,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Back up whenever the newest archive is older than the interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "backup scheduler started");
        loop {
            let latest = BackupChain::discover(&self.backup_dir)
                .ok()
                .and_then(|chain| chain.latest().map(|r| r.created_at));
            let delay = next_backup_delay(self.interval, latest, Utc::now());
            debug!(delay_secs = delay.as_secs(), "next backup scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => self.tick().await,
                _ = shutdown.changed() => {
                    info!("backup scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        match self.job.run(false).await {
            Ok(report) => {
                if let TransferOutcome::Failed { reason, pending } = &report.transfer {
                    warn!(pending, error = %reason, "remote transfer failed, will retry next run");
                }
            }
            Err(ArchiveError::Busy(lock)) => {
                info!(lock = %lock.display(), "another run holds the lock, skipping backup");
                // Retry after a short pause rather than a full interval.
                tokio::time::sleep(self.interval.min(Duration::from_secs(60))).await;
            }
            Err(e) => {
                warn!(class = %e.class(), error = %e, "scheduled backup failed");
                tokio::time::sleep(self.interval.min(Duration::from_secs(300))).await;
            }
        }
    }
}

/// Why a staged release is or is not applied automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyDecision {
    Apply,
    AlreadyInstalled,
    NotNewer,
    PreviouslyRolledBack,
}

/// Auto-apply only moves forward and never retries a version that was
/// already rolled back or left the appliance in a failed state.
pub fn decide(candidate: &str, status: &TxStatus) -> ApplyDecision {
    if status.installed_version.as_deref() == Some(candidate) {
        return ApplyDecision::AlreadyInstalled;
    }
    let failed_before = status.version.as_deref() == Some(candidate)
        && matches!(status.state, TxState::RolledBack | TxState::Failed);
    if failed_before {
        return ApplyDecision::PreviouslyRolledBack;
    }
    if let (Some(installed), Ok(next)) = (
        status.installed_version.as_deref().and_then(|v| parse_version(v).ok()),
        parse_version(candidate),
    ) {
        if next <= installed {
            return ApplyDecision::NotNewer;
        }
    }
    ApplyDecision::Apply
}

/// Downloading is pointless for a version that is already installed or
/// whose last transaction failed, since it would never be applied.
pub fn worth_fetching(version: &str, status: &TxStatus) -> bool {
    !matches!(
        decide(version, status),
        ApplyDecision::AlreadyInstalled | ApplyDecision::PreviouslyRolledBack
    )
}

pub struct ReleaseLoop {
    fetcher: ReleaseFetcher,
    channel: Channel,
    controller: Option<Arc<ApplyRollbackController>>,
    status: StatusStore,
    interval: Duration,
    auto_apply: bool,
}

impl ReleaseLoop {
    pub fn new(
        fetcher: ReleaseFetcher,
        channel: Channel,
        controller: Option<Arc<ApplyRollbackController>>,
        status_path: PathBuf,
        interval: Duration,
        auto_apply: bool,
    ) -> Self {
        Self {
            fetcher,
            channel,
            controller,
            status: StatusStore::new(status_path),
            interval,
            auto_apply,
        }
    }

    /// Fetch at startup, then once per interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "release scheduler started");
        self.tick().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => self.tick().await,
                _ = shutdown.changed() => {
                    info!("release scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        // The mirror is written by other processes too; read it fresh.
        let status = self.status.load().unwrap_or_default();
        let candidate = match self
            .fetcher
            .fetch_wanted(&self.channel, |version| worth_fetching(version, &status))
            .await
        {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                debug!(channel = %self.channel.name, "channel release already installed or rolled back");
                return;
            }
            Err(e) => {
                warn!(channel = %self.channel.name, class = %e.class(), error = %e, "release fetch failed");
                return;
            }
        };

        let Some(controller) = self.controller.as_ref().filter(|_| self.auto_apply) else {
            info!(version = %candidate.version, "release staged, waiting for an operator to apply it");
            return;
        };
        match decide(&candidate.version, &status) {
            ApplyDecision::Apply => {}
            other => {
                debug!(version = %candidate.version, decision = ?other, "not applying staged release");
                return;
            }
        }

        match controller.trigger().await {
            Ok(TxOutcome::Committed { version }) => info!(version = %version, "automatic update committed"),
            Ok(TxOutcome::RolledBack {
                version,
                failed_stage,
                reason,
            }) => warn!(
                version = %version,
                stage = %failed_stage,
                error = %reason,
                "automatic update rolled back"
            ),
            Err(UpdateError::Busy) => info!("another run holds the lock, update deferred"),
            Err(e) if e.class() == ErrorClass::Critical => {
                error!(error = %e, "automatic update left the appliance in a failed state")
            }
            Err(e) => warn!(class = %e.class(), error = %e, "automatic update aborted"),
        }
    }
}
