//! keeperd: the keeper daemon.
//!
//! Runs the scheduled work for one appliance:
//! - Backups of the configured targets, with retention and remote transfer
//! - Release fetches from the configured channel
//! - Optional automatic apply of newly staged releases
//!
//! # Usage
//!
//! ```text
//! keeperd run --config /etc/keeper/keeper.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keeper_archive::BackupJob;
use keeper_core::KeeperConfig;
use keeper_release::{Channel, ChannelTransport, ReleaseFetcher};
use keeper_update::ApplyRollbackController;
use tokio::sync::watch;
use tracing::info;

mod scheduler;

use scheduler::{BackupLoop, ReleaseLoop};

#[derive(Parser)]
#[command(name = "keeperd", about = "keeper daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the backup and release schedulers until interrupted.
    Run {
        /// Path to keeper.toml.
        #[arg(long, default_value = "/etc/keeper/keeper.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeper=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_json } => {
            init_tracing(log_json);
            run(config).await
        }
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = KeeperConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(config = %config_path.display(), "keeper daemon starting");

    // ── Subsystems ─────────────────────────────────────────────

    let backups = BackupLoop::new(
        Arc::new(BackupJob::from_config(&config)?),
        config.schedule.backup_interval()?,
        config.paths.backup_dir.clone(),
    );
    info!(
        interval_secs = backups.interval().as_secs(),
        targets = config.backup.targets.len(),
        "backup scheduler initialized"
    );

    let releases = match &config.release {
        Some(release) => {
            let channel = Channel::from_config(release)?;
            let transport = ChannelTransport::with_credential_file(
                release.credential_file.as_deref(),
                release.timeout()?,
            )?;
            let fetcher = ReleaseFetcher::new(Arc::new(transport), &config.paths.staging_dir);
            let controller = config
                .update
                .as_ref()
                .map(|_| ApplyRollbackController::from_config(&config).map(Arc::new))
                .transpose()?;
            info!(
                channel = %channel.name,
                version = %channel.version,
                auto_apply = config.schedule.auto_apply && controller.is_some(),
                "release scheduler initialized"
            );
            Some(ReleaseLoop::new(
                fetcher,
                channel,
                controller,
                config.paths.status_path(),
                config.schedule.fetch_interval()?,
                config.schedule.auto_apply,
            ))
        }
        None => {
            info!("no release channel configured, updates disabled");
            None
        }
    };

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let backup_shutdown = shutdown_rx.clone();
    let backup_handle = tokio::spawn(async move {
        backups.run(backup_shutdown).await;
    });

    let release_handle = releases.map(|releases| {
        let release_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            releases.run(release_shutdown).await;
        })
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for background tasks; an in-flight backup or transaction finishes first.
    let _ = backup_handle.await;
    if let Some(handle) = release_handle {
        let _ = handle.await;
    }

    info!("keeper daemon stopped");
    Ok(())
}

/// Ctrl-C, or SIGTERM from the service manager.
#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to install CTRL+C handler")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")
}
