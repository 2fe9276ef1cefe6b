//! keeper.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    pub paths: PathsConfig,
    pub backup: BackupConfig,
    pub release: Option<ReleaseConfig>,
    pub update: Option<UpdateConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// On-disk layout for keeper's own state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Working location for the RollbackPoint of an in-flight transaction.
    pub rollback_dir: PathBuf,
    /// Where RollbackPoint archives are moved once a transaction ends.
    pub history_dir: PathBuf,
}

impl PathsConfig {
    pub fn snapshot_state_path(&self) -> PathBuf {
        self.state_dir.join("snapshot-state.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("keeper.lock")
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("update-status.json")
    }

    /// Archive names already copied to the remote target.
    pub fn transfer_ledger_path(&self) -> PathBuf {
        self.state_dir.join("transfer-ledger.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub targets: Vec<PathBuf>,
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Free space that must remain at the destination after an archive is written.
    #[serde(default = "default_reserve_bytes")]
    pub reserve_bytes: u64,
    pub retention: RetentionConfig,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionConfig {
    pub max_full_count: u32,
    pub max_age_days: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    Https,
    File,
}

/// Off-device copy of each published archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub protocol: RemoteProtocol,
    /// Base URL for `https`, directory for `file`.
    pub endpoint: String,
    pub credential_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub channel: String,
    /// Base URL (`https://…`) or directory (`file://…`) of the release feed.
    pub endpoint: String,
    /// `latest` or an exact version tag.
    #[serde(default = "default_version")]
    pub version: String,
    pub credential_file: Option<PathBuf>,
    #[serde(default = "default_transfer_timeout")]
    pub timeout: String,
}

impl ReleaseConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("release.timeout", &self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub install_dir: PathBuf,
    pub unit_dir: PathBuf,
    /// Managed services, stopped before apply and restarted after.
    pub units: Vec<String>,
    pub health: HealthProbeConfig,
    #[serde(default = "default_history_keep")]
    pub history_keep: usize,
    #[serde(default = "default_systemctl")]
    pub systemctl: PathBuf,
    #[serde(default = "default_reserve_bytes")]
    pub reserve_bytes: u64,
}

impl UpdateConfig {
    /// Unit definition files covered by the RollbackPoint.
    pub fn unit_files(&self) -> Vec<PathBuf> {
        self.units.iter().map(|u| self.unit_dir.join(u)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbeConfig {
    /// `host:port` of the application's liveness endpoint.
    pub address: String,
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Overall verification budget after restart.
    #[serde(default = "default_health_timeout")]
    pub timeout: String,
    /// Delay between probes while verifying.
    #[serde(default = "default_health_interval")]
    pub interval: String,
}

impl HealthProbeConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("update.health.timeout", &self.timeout)
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        duration_field("update.health.interval", &self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_backup_interval")]
    pub backup_interval: String,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: String,
    /// Apply a freshly verified release without operator action.
    #[serde(default)]
    pub auto_apply: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backup_interval: default_backup_interval(),
            fetch_interval: default_fetch_interval(),
            auto_apply: false,
        }
    }
}

impl ScheduleConfig {
    pub fn backup_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("schedule.backup_interval", &self.backup_interval)
    }

    pub fn fetch_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("schedule.fetch_interval", &self.fetch_interval)
    }
}

fn default_reserve_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_transfer_timeout() -> String {
    "60s".to_string()
}

fn default_history_keep() -> usize {
    5
}

fn default_systemctl() -> PathBuf {
    PathBuf::from("systemctl")
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_health_timeout() -> String {
    "30s".to_string()
}

fn default_health_interval() -> String {
    "1s".to_string()
}

fn default_backup_interval() -> String {
    "6h".to_string()
}

fn default_fetch_interval() -> String {
    "1h".to_string()
}

fn duration_field(name: &str, value: &str) -> Result<Duration, ConfigError> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::Invalid(format!(
            "{name}: expected a positive duration like \"30s\", got {value:?}"
        ))),
    }
}

impl KeeperConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: KeeperConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would let a component mutate anything unsafely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let backup = &self.backup;
        if backup.targets.is_empty() {
            return Err(invalid("backup.targets must name at least one path"));
        }
        for target in &backup.targets {
            if !target.is_absolute() {
                return Err(invalid(format!(
                    "backup.targets: {} is not an absolute path",
                    target.display()
                )));
            }
        }
        for pattern in &backup.excludes {
            if pattern.trim().is_empty() {
                return Err(invalid("backup.excludes contains an empty pattern"));
            }
        }
        if backup.retention.max_full_count == 0 {
            return Err(invalid("backup.retention.max_full_count must be at least 1"));
        }

        let paths = &self.paths;
        let dirs = [
            ("paths.backup_dir", &paths.backup_dir),
            ("paths.staging_dir", &paths.staging_dir),
            ("paths.rollback_dir", &paths.rollback_dir),
            ("paths.history_dir", &paths.history_dir),
        ];
        for (i, (name, dir)) in dirs.iter().enumerate() {
            for (other_name, other) in dirs.iter().skip(i + 1) {
                if dir.starts_with(other) || other.starts_with(dir) {
                    return Err(invalid(format!("{name} and {other_name} overlap")));
                }
            }
            if backup.targets.iter().any(|t| dir.starts_with(t)) {
                return Err(invalid(format!("{name} lies inside a backup target")));
            }
        }

        if let Some(release) = &self.release {
            if release.channel.trim().is_empty() {
                return Err(invalid("release.channel must not be empty"));
            }
            release.timeout()?;
        }

        if let Some(update) = &self.update {
            if update.units.is_empty() {
                return Err(invalid("update.units must name at least one managed unit"));
            }
            if !update.install_dir.is_absolute() {
                return Err(invalid("update.install_dir must be an absolute path"));
            }
            if update.history_keep == 0 {
                return Err(invalid("update.history_keep must be at least 1"));
            }
            update.health.timeout()?;
            update.health.interval()?;
        }

        self.schedule.backup_interval()?;
        self.schedule.fetch_interval()?;
        Ok(())
    }

    /// Scaffold a keeper.toml for the capture appliance layout.
    pub fn scaffold() -> Self {
        let state = PathBuf::from("/var/lib/keeper");
        KeeperConfig {
            paths: PathsConfig {
                state_dir: state.clone(),
                backup_dir: state.join("backups"),
                staging_dir: state.join("staging"),
                rollback_dir: state.join("rollback"),
                history_dir: state.join("rollback-history"),
            },
            backup: BackupConfig {
                targets: vec![
                    PathBuf::from("/opt/capture"),
                    PathBuf::from("/etc/capture"),
                ],
                excludes: vec!["*.log".to_string(), "cache".to_string()],
                reserve_bytes: default_reserve_bytes(),
                retention: RetentionConfig {
                    max_full_count: 3,
                    max_age_days: 30,
                },
                remote: None,
            },
            release: Some(ReleaseConfig {
                channel: "stable".to_string(),
                endpoint: "https://releases.example.com".to_string(),
                version: default_version(),
                credential_file: Some(PathBuf::from("/etc/keeper/release.token")),
                timeout: default_transfer_timeout(),
            }),
            update: Some(UpdateConfig {
                install_dir: PathBuf::from("/opt/capture"),
                unit_dir: PathBuf::from("/etc/systemd/system"),
                units: vec![
                    "capture.service".to_string(),
                    "control-api.service".to_string(),
                ],
                health: HealthProbeConfig {
                    address: "127.0.0.1:8080".to_string(),
                    path: default_health_path(),
                    timeout: default_health_timeout(),
                    interval: default_health_interval(),
                },
                history_keep: default_history_keep(),
                systemctl: default_systemctl(),
                reserve_bytes: default_reserve_bytes(),
            }),
            schedule: ScheduleConfig::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
