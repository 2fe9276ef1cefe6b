use std::process::ExitCode;

use keeper_archive::BackupChain;
use keeper_core::{ErrorClass, KeeperConfig};
use keeper_release::StagingArea;
use keeper_update::{ApplyRollbackController, StatusStore, TxOutcome};
use serde_json::json;

use super::{class_exit, emit};
use crate::Format;

pub async fn apply(config: &KeeperConfig, format: Format) -> anyhow::Result<ExitCode> {
    let controller = ApplyRollbackController::from_config(config)?;
    let outcome = controller.trigger().await?;

    emit(format, &outcome, |o| match o {
        TxOutcome::Committed { version } => println!("✓ {version} committed"),
        TxOutcome::RolledBack {
            version,
            failed_stage,
            reason,
        } => {
            println!("✗ {version} failed during {failed_stage}: {reason}");
            println!("  previous release restored");
        }
    })?;

    match outcome {
        TxOutcome::Committed { .. } => Ok(ExitCode::SUCCESS),
        TxOutcome::RolledBack { .. } => Ok(class_exit(ErrorClass::Transaction)),
    }
}

/// Reads the persisted status; works while the daemon holds the lock.
pub fn status(config: &KeeperConfig, format: Format) -> anyhow::Result<ExitCode> {
    let update = StatusStore::new(config.paths.status_path())
        .load()
        .unwrap_or_default();
    let staged = StagingArea::new(&config.paths.staging_dir).latest_ready()?;
    let latest_backup = BackupChain::discover(&config.paths.backup_dir)?
        .latest()
        .cloned();

    let value = json!({
        "update": update,
        "staged": staged.as_ref().map(|c| &c.version),
        "latestBackup": latest_backup,
    });
    emit(format, &value, |_| {
        println!("update:     {}", update.state);
        if let Some(version) = &update.installed_version {
            println!("installed:  {version}");
        }
        if let Some(version) = &update.version {
            println!("last tx:    {version} at {}", update.updated_at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(err) = &update.last_error {
            println!("last error: {err}");
        }
        match &staged {
            Some(c) => println!("staged:     {} (verified {})", c.version, c.verified_at.format("%Y-%m-%d %H:%M:%S")),
            None => println!("staged:     none"),
        }
        match &latest_backup {
            Some(r) => println!("backup:     {} ({})", r.name, r.created_at.format("%Y-%m-%d %H:%M:%S")),
            None => println!("backup:     none"),
        }
    })?;
    Ok(ExitCode::SUCCESS)
}
