use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "keeper",
    about = "keeper: backups and transactional updates for the capture appliance",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to keeper.toml
    #[arg(short, long, global = true, default_value = "/etc/keeper/keeper.toml")]
    config: PathBuf,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive the backup targets (incremental when a basis exists).
    Backup {
        /// Ignore the stored basis and write a full archive.
        #[arg(long)]
        full: bool,
    },
    /// Apply the retention window to the backup directory.
    Prune {
        /// Show what would be deleted without deleting it.
        #[arg(long)]
        dry_run: bool,
    },
    /// List archives grouped by chain, plus orphans.
    Chain,
    /// Restore the chain ending at an archive.
    Restore {
        /// Archive name to restore up to.
        #[arg(long)]
        upto: String,
        /// Re-root restored paths under this directory instead of in place.
        #[arg(long)]
        into: Option<PathBuf>,
    },
    /// Download and verify the configured release into staging.
    Fetch,
    /// Apply the newest staged release, rolling back on failure.
    Apply,
    /// Show the update status, staged release and latest backup.
    Status,
    /// Work with keeper.toml
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a scaffold keeper.toml, or write it with --output.
    Init {
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Parse and validate the configuration.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,keeper=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            commands::exit_code(&e)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let format = cli.format;
    if let Commands::Config { action } = cli.command {
        return match action {
            ConfigAction::Init { output, force } => commands::config::init(output, force),
            ConfigAction::Check => commands::config::check(&cli.config, format),
        };
    }

    let config = commands::load_config(&cli.config)?;
    match cli.command {
        Commands::Backup { full } => commands::backup::backup(&config, full, format).await,
        Commands::Prune { dry_run } => commands::backup::prune(&config, dry_run, format).await,
        Commands::Chain => commands::backup::chain(&config, format),
        Commands::Restore { upto, into } => {
            commands::backup::restore(&config, &upto, into, format).await
        }
        Commands::Fetch => commands::release::fetch(&config, format).await,
        Commands::Apply => commands::update::apply(&config, format).await,
        Commands::Status => commands::update::status(&config, format),
        Commands::Config { .. } => Ok(ExitCode::SUCCESS),
    }
}
