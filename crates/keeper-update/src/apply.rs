//! Installing a staged release over the live tree.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use flate2::read::GzDecoder;
use keeper_release::{AssetRole, ReleaseCandidate, StagedAsset};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{UpdateError, UpdateResult, io_err};

/// Upper bound on a post-apply hook's runtime.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// What an apply changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Regular files in the new install tree.
    pub files: usize,
    /// Unit definitions written to the unit directory.
    pub units: Vec<String>,
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.with_file_name(format!(".{name}.{suffix}"))
}

fn remove_tree(path: &Path) -> UpdateResult<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(io_err(format!("failed to remove {}", path.display()))(e))
        }
        _ => Ok(()),
    }
}

fn is_tarball(name: &str) -> bool {
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Build the new tree beside `install_dir`, swap it in, then install units.
///
/// The previous tree is only removed after the new one is in place. If the
/// swap itself fails the previous tree is put back.
pub fn apply_release(
    candidate: &ReleaseCandidate,
    install_dir: &Path,
    unit_dir: &Path,
) -> UpdateResult<ApplyReport> {
    let incoming = sibling(install_dir, "incoming");
    let outgoing = sibling(install_dir, "outgoing");
    remove_tree(&incoming)?;
    remove_tree(&outgoing)?;
    fs::create_dir_all(&incoming)
        .map_err(io_err(format!("failed to create {}", incoming.display())))?;

    for asset in candidate.assets_with_role(AssetRole::Payload) {
        if let Err(e) = place_payload(asset, &incoming) {
            let _ = fs::remove_dir_all(&incoming);
            return Err(e);
        }
    }
    let files = WalkDir::new(&incoming)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .count();

    swap_in(&incoming, install_dir, &outgoing)?;
    if let Err(e) = fs::remove_dir_all(&outgoing) {
        warn!(path = %outgoing.display(), error = %e, "failed to remove previous tree");
    }

    fs::create_dir_all(unit_dir)
        .map_err(io_err(format!("failed to create {}", unit_dir.display())))?;
    let mut units = Vec::new();
    for asset in candidate.assets_with_role(AssetRole::Unit) {
        install_unit(asset, unit_dir)?;
        units.push(asset.name.clone());
    }

    info!(
        version = %candidate.version,
        install_dir = %install_dir.display(),
        files,
        units = units.len(),
        "release applied"
    );
    Ok(ApplyReport { files, units })
}

fn place_payload(asset: &StagedAsset, incoming: &Path) -> UpdateResult<()> {
    if is_tarball(&asset.name) {
        let file = File::open(&asset.path)
            .map_err(io_err(format!("failed to open {}", asset.path.display())))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);
        archive
            .unpack(incoming)
            .map_err(|e| UpdateError::Apply(format!("failed to unpack {}: {e}", asset.name)))?;
        debug!(asset = %asset.name, "payload unpacked");
    } else {
        let dest = incoming.join(&asset.name);
        fs::copy(&asset.path, &dest)
            .map_err(io_err(format!("failed to copy {}", asset.name)))?;
        debug!(asset = %asset.name, "payload copied");
    }
    Ok(())
}

fn swap_in(incoming: &Path, install_dir: &Path, outgoing: &Path) -> UpdateResult<()> {
    let had_previous = install_dir.exists();
    if had_previous {
        fs::rename(install_dir, outgoing)
            .map_err(io_err(format!("failed to move aside {}", install_dir.display())))?;
    }
    if let Err(e) = fs::rename(incoming, install_dir) {
        if had_previous {
            let _ = fs::rename(outgoing, install_dir);
        }
        let _ = fs::remove_dir_all(incoming);
        return Err(io_err(format!("failed to install {}", install_dir.display()))(e));
    }
    if let Some(parent) = install_dir.parent() {
        keeper_core::fsutil::fsync_dir(parent).ok();
    }
    Ok(())
}

fn install_unit(asset: &StagedAsset, unit_dir: &Path) -> UpdateResult<()> {
    let dest = unit_dir.join(&asset.name);
    let tmp = keeper_core::fsutil::temp_sibling(&dest);
    fs::copy(&asset.path, &tmp).map_err(io_err(format!("failed to copy {}", asset.name)))?;
    if let Err(e) = fs::rename(&tmp, &dest) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(format!("failed to install {}", dest.display()))(e));
    }
    debug!(unit = %asset.name, "unit definition installed");
    Ok(())
}

/// Run the release's post-apply hook from inside the install directory.
pub async fn run_hook(hook: &StagedAsset, install_dir: &Path, version: &str) -> UpdateResult<()> {
    let failed = |reason: String| UpdateError::Hook {
        hook: hook.name.clone(),
        reason,
    };
    make_executable(&hook.path)?;

    let child = Command::new(&hook.path)
        .current_dir(install_dir)
        .env("KEEPER_VERSION", version)
        .env("KEEPER_INSTALL_DIR", install_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(HOOK_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(failed(format!("could not start: {e}"))),
        Err(_) => return Err(failed(format!("timed out after {HOOK_TIMEOUT:?}"))),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let status = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(failed(format!("exit {status}: {stderr}")));
    }
    info!(hook = %hook.name, version, "post-apply hook succeeded");
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> UpdateResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(io_err(format!("failed to mark {} executable", path.display())))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> UpdateResult<()> {
    Ok(())
}
