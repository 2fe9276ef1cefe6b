use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use keeper_archive::{BackupJob, TransferOutcome};
use keeper_core::{ErrorClass, KeeperConfig};
use serde_json::json;

use super::{class_exit, emit, human_bytes};
use crate::Format;

pub async fn backup(config: &KeeperConfig, full: bool, format: Format) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(config)?;
    let report = job.run(full).await.context("backup failed")?;

    emit(format, &report, |r| {
        println!(
            "✓ {} ({}, {} changed, {} deleted)",
            r.record.name,
            human_bytes(r.record.size_bytes),
            r.record.changed_entries,
            r.record.deleted_entries
        );
        for item in &r.pruned {
            println!("  pruned {} ({:?})", item.name, item.reason);
        }
        match &r.transfer {
            TransferOutcome::Skipped => {}
            TransferOutcome::Uploaded { archives } => {
                println!("  uploaded {} archive(s)", archives.len())
            }
            TransferOutcome::Failed { reason, pending } => {
                println!("  transfer failed ({pending} pending): {reason}")
            }
        }
    })?;

    // The local archive is good either way; a failed upload is retried next run.
    if matches!(report.transfer, TransferOutcome::Failed { .. }) {
        return Ok(class_exit(ErrorClass::Transfer));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn prune(config: &KeeperConfig, dry_run: bool, format: Format) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(config)?;
    let plan = job.prune(dry_run).await.context("prune failed")?;

    emit(format, &plan, |plan| {
        let verb = if dry_run { "would delete" } else { "deleted" };
        if plan.is_empty() {
            println!("nothing to prune ({} archive(s) kept)", plan.keep.len());
        }
        for item in &plan.delete {
            println!("{verb} {} ({:?})", item.name, item.reason);
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

pub fn chain(config: &KeeperConfig, format: Format) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(config)?;
    let backups = job.chain()?;

    let value = json!({
        "records": backups.records(),
        "orphans": backups.orphans(),
    });
    emit(format, &value, |_| {
        for (root, members) in backups.chains() {
            println!("{root}");
            for record in members.iter().skip(1) {
                println!(
                    "  └ {} ({}, {})",
                    record.name,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    human_bytes(record.size_bytes)
                );
            }
        }
        for orphan in backups.orphans() {
            println!("orphan {}: {}", orphan.path.display(), orphan.reason);
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

pub async fn restore(
    config: &KeeperConfig,
    upto: &str,
    into: Option<PathBuf>,
    format: Format,
) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(config)?;
    let report = job
        .restore(upto, into.clone())
        .await
        .with_context(|| format!("restore up to {upto} failed"))?;

    emit(format, &report, |r| {
        let target = into
            .as_ref()
            .map_or_else(|| "in place".to_string(), |d| format!("under {}", d.display()));
        println!(
            "✓ restored {} archive(s) {target}: {} written, {} removed",
            r.applied.len(),
            r.written,
            r.removed
        );
    })?;
    Ok(ExitCode::SUCCESS)
}
