use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::bail;
use keeper_core::KeeperConfig;
use serde_json::json;

use super::{emit, load_config};
use crate::Format;

pub fn init(output: Option<PathBuf>, force: bool) -> anyhow::Result<ExitCode> {
    let rendered = KeeperConfig::scaffold().to_toml_string()?;
    match output {
        None => print!("{rendered}"),
        Some(path) => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            keeper_core::fsutil::write_atomic(&path, rendered.as_bytes())?;
            println!("✓ Generated {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn check(path: &Path, format: Format) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    let value = json!({
        "config": path,
        "targets": config.backup.targets,
        "release": config.release.as_ref().map(|r| &r.channel),
        "units": config.update.as_ref().map(|u| &u.units),
    });
    emit(format, &value, |_| {
        println!("✓ {} is valid", path.display());
        println!("  {} backup target(s)", config.backup.targets.len());
        if let Some(release) = &config.release {
            println!("  release channel {} ({})", release.channel, release.version);
        }
        if let Some(update) = &config.update {
            println!("  managed units: {}", update.units.join(", "));
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keeper.toml");
        init(Some(path.clone()), false).unwrap();
        assert!(KeeperConfig::from_file(&path).is_ok());

        assert!(init(Some(path.clone()), false).is_err());
        init(Some(path), true).unwrap();
    }
}
