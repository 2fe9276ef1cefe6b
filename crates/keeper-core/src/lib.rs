//! keeper-core: shared configuration and error vocabulary for keeper.
//!
//! Every keeper component takes its settings as an explicit value built
//! from [`KeeperConfig`]; nothing reads the environment or the config file
//! on its own. Only the binaries call [`KeeperConfig::from_file`].

pub mod config;
pub mod duration;
pub mod error;
pub mod fsutil;

pub use config::{
    BackupConfig, HealthProbeConfig, KeeperConfig, PathsConfig, ReleaseConfig, RemoteConfig,
    RemoteProtocol, RetentionConfig, ScheduleConfig, UpdateConfig,
};
pub use duration::parse_duration;
pub use error::{ConfigError, ErrorClass};
