pub mod backup;
pub mod config;
pub mod release;
pub mod update;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use keeper_archive::ArchiveError;
use keeper_core::{ConfigError, ErrorClass, KeeperConfig};
use keeper_release::ReleaseError;
use keeper_update::UpdateError;
use serde::Serialize;

use crate::Format;

pub fn load_config(path: &Path) -> anyhow::Result<KeeperConfig> {
    KeeperConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// The class of the first keeper error in the chain.
pub fn error_class(err: &anyhow::Error) -> Option<ErrorClass> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<UpdateError>() {
            Some(e.class())
        } else if let Some(e) = cause.downcast_ref::<ArchiveError>() {
            Some(e.class())
        } else if let Some(e) = cause.downcast_ref::<ReleaseError>() {
            Some(e.class())
        } else {
            cause.downcast_ref::<ConfigError>().map(ConfigError::class)
        }
    })
}

pub fn exit_code(err: &anyhow::Error) -> ExitCode {
    let code = error_class(err).map_or(1, ErrorClass::exit_code);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Exit code for a run that completed but ended in the given class.
pub fn class_exit(class: ErrorClass) -> ExitCode {
    ExitCode::from(u8::try_from(class.exit_code()).unwrap_or(1))
}

/// Print `value` as JSON, or run `text` for the human format.
pub fn emit<T: Serialize>(format: Format, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Text => text(value),
    }
    Ok(())
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_found_through_context() {
        let err = anyhow::Error::new(ArchiveError::Busy("/var/lib/keeper/keeper.lock".into()))
            .context("running backup");
        assert_eq!(error_class(&err), Some(ErrorClass::Resource));
        assert_eq!(error_class(&anyhow::anyhow!("plain")), None);
    }

    #[test]
    fn update_errors_keep_their_inner_class() {
        let err = anyhow::Error::new(UpdateError::Critical("restore failed".into()));
        assert_eq!(error_class(&err), Some(ErrorClass::Critical));
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}
