//! The staging directory and the release candidates kept in it.
//!
//! Layout under the staging root:
//!
//! ```text
//! <version>.partial/       download in progress, never trusted
//! <version>/               verified assets
//! <version>/.release.json  descriptor with resolved asset locations
//! <version>/.ready         marker; its presence is what makes a version Ready
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::descriptor::{AssetRole, ReleaseDescriptor, parse_version};
use crate::error::{ReleaseError, ReleaseResult, io_err};

pub const READY_MARKER: &str = ".ready";
pub const DESCRIPTOR_COPY: &str = ".release.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Lifecycle of a candidate: `Fetching → Verifying → Ready | Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateState {
    Fetching,
    Verifying,
    Ready,
    Rejected,
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateState::Fetching => "fetching",
            CandidateState::Verifying => "verifying",
            CandidateState::Ready => "ready",
            CandidateState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Contents of the `.ready` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyMarker {
    pub version: String,
    pub verified_at: DateTime<Utc>,
    /// Verified SHA-256 per asset name.
    pub assets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedAsset {
    pub name: String,
    pub role: AssetRole,
    pub path: PathBuf,
    pub sha256: String,
}

/// A release whose assets sit verified in the staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCandidate {
    pub version: String,
    pub asset_uris: Vec<String>,
    pub checksum_manifest_uri: String,
    pub staging_dir: PathBuf,
    pub state: CandidateState,
    pub verified_at: DateTime<Utc>,
    pub assets: Vec<StagedAsset>,
}

impl ReleaseCandidate {
    pub fn assets_with_role(&self, role: AssetRole) -> impl Iterator<Item = &StagedAsset> {
        self.assets.iter().filter(move |a| a.role == role)
    }

    pub fn hook(&self) -> Option<&StagedAsset> {
        self.assets_with_role(AssetRole::Hook).next()
    }

    /// Bytes the assets occupy in staging.
    pub fn staged_bytes(&self) -> u64 {
        self.assets
            .iter()
            .filter_map(|a| fs::metadata(&a.path).ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Handle on the staging root.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    pub fn partial_dir(&self, version: &str) -> PathBuf {
        self.root.join(format!("{version}{PARTIAL_SUFFIX}"))
    }

    /// The marker for `version`, if present and consistent.
    pub fn marker(&self, version: &str) -> Option<ReadyMarker> {
        let path = self.version_dir(version).join(READY_MARKER);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice::<ReadyMarker>(&bytes) {
            Ok(marker) if marker.version == version => Some(marker),
            Ok(_) => {
                warn!(path = %path.display(), "ready marker names a different version");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable ready marker");
                None
            }
        }
    }

    pub fn is_ready(&self, version: &str) -> bool {
        self.marker(version).is_some()
    }

    /// Load the Ready candidate for `version`.
    pub fn ready_candidate(&self, version: &str) -> ReleaseResult<ReleaseCandidate> {
        let not_ready = || ReleaseError::NotReady(Some(version.to_string()));
        let marker = self.marker(version).ok_or_else(not_ready)?;
        let dir = self.version_dir(version);
        let bytes = fs::read(dir.join(DESCRIPTOR_COPY)).map_err(|_| not_ready())?;
        let descriptor: ReleaseDescriptor = serde_json::from_slice(&bytes)
            .map_err(|e| ReleaseError::Serialize(format!("{}: {e}", dir.display())))?;

        let mut assets = Vec::with_capacity(descriptor.assets.len());
        for asset in &descriptor.assets {
            let sha256 = marker.assets.get(&asset.name).cloned().ok_or_else(not_ready)?;
            assets.push(StagedAsset {
                name: asset.name.clone(),
                role: asset.role,
                path: dir.join(&asset.name),
                sha256,
            });
        }
        Ok(ReleaseCandidate {
            version: marker.version,
            asset_uris: descriptor.assets.iter().map(|a| a.uri.clone()).collect(),
            checksum_manifest_uri: descriptor.checksum_manifest,
            staging_dir: dir,
            state: CandidateState::Ready,
            verified_at: marker.verified_at,
            assets,
        })
    }

    /// Highest Ready version in staging, if any.
    pub fn latest_ready(&self) -> ReleaseResult<Option<ReleaseCandidate>> {
        let listing = match fs::read_dir(&self.root) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(format!("failed to list {}", self.root.display()))(e)),
        };
        let newest = listing
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| parse_version(&name).ok().map(|v| (v, name)))
            .filter(|(_, name)| self.is_ready(name))
            .max_by(|a, b| a.0.cmp(&b.0));
        newest
            .map(|(_, name)| self.ready_candidate(&name))
            .transpose()
    }

    /// Re-hash every staged asset against the marker.
    pub fn reverify(&self, candidate: &ReleaseCandidate) -> ReleaseResult<()> {
        for asset in &candidate.assets {
            let actual = keeper_core::fsutil::sha256_file(&asset.path).map_err(|e| {
                ReleaseError::VerificationFailed {
                    version: candidate.version.clone(),
                    reason: format!("{}: {e}", asset.name),
                }
            })?;
            if actual != asset.sha256 {
                return Err(ReleaseError::VerificationFailed {
                    version: candidate.version.clone(),
                    reason: format!("{} changed after staging", asset.name),
                });
            }
        }
        Ok(())
    }

    /// Fresh, empty partial directory for `version`. Stale partial and
    /// unmarked directories for the same version are removed first.
    pub fn begin(&self, version: &str) -> ReleaseResult<PathBuf> {
        let partial = self.partial_dir(version);
        remove_dir(&partial)?;
        if !self.is_ready(version) {
            remove_dir(&self.version_dir(version))?;
        }
        fs::create_dir_all(&partial)
            .map_err(io_err(format!("failed to create {}", partial.display())))?;
        Ok(partial)
    }

    /// Promote a verified partial directory and write its marker.
    pub fn publish(
        &self,
        partial: &Path,
        descriptor: &ReleaseDescriptor,
        version: &str,
        hashes: BTreeMap<String, String>,
    ) -> ReleaseResult<ReleaseCandidate> {
        let copy = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| ReleaseError::Serialize(e.to_string()))?;
        keeper_core::fsutil::write_atomic(&partial.join(DESCRIPTOR_COPY), &copy)
            .map_err(io_err("failed to store release descriptor"))?;

        let dir = self.version_dir(version);
        remove_dir(&dir)?;
        fs::rename(partial, &dir)
            .map_err(io_err(format!("failed to promote {}", partial.display())))?;
        keeper_core::fsutil::fsync_dir(&self.root).ok();

        let marker = ReadyMarker {
            version: version.to_string(),
            verified_at: Utc::now(),
            assets: hashes,
        };
        let json = serde_json::to_vec_pretty(&marker)
            .map_err(|e| ReleaseError::Serialize(e.to_string()))?;
        keeper_core::fsutil::write_atomic(&dir.join(READY_MARKER), &json)
            .map_err(io_err("failed to write ready marker"))?;
        info!(version, dir = %dir.display(), state = %CandidateState::Ready, "release staged");
        self.ready_candidate(version)
    }

    /// Remove everything staged for `version`.
    pub fn discard(&self, version: &str) -> ReleaseResult<()> {
        remove_dir(&self.partial_dir(version))?;
        remove_dir(&self.version_dir(version))?;
        debug!(version, "staging discarded");
        Ok(())
    }

    /// Remove partial downloads and directories that never got a marker.
    pub fn sweep(&self) -> ReleaseResult<usize> {
        let listing = match fs::read_dir(&self.root) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(format!("failed to list {}", self.root.display()))(e)),
        };
        let mut removed = 0;
        for entry in listing.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = name.ends_with(PARTIAL_SUFFIX)
                || (entry.path().is_dir() && !self.is_ready(&name));
            if stale {
                remove_dir(&entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn remove_dir(path: &Path) -> ReleaseResult<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(io_err(format!("failed to remove {}", path.display()))(e))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AssetRef;

    fn descriptor() -> ReleaseDescriptor {
        ReleaseDescriptor {
            version: "1.2.0".into(),
            assets: vec![AssetRef {
                name: "capture.tar.gz".into(),
                uri: "file:///mirror/capture.tar.gz".into(),
                role: AssetRole::Payload,
            }],
            checksum_manifest: "file:///mirror/SHA256SUMS".into(),
        }
    }

    fn stage(area: &StagingArea, version: &str) -> ReleaseCandidate {
        let partial = area.begin(version).unwrap();
        fs::write(partial.join("capture.tar.gz"), b"payload").unwrap();
        let sum = keeper_core::fsutil::sha256_bytes(b"payload");
        let hashes = BTreeMap::from([("capture.tar.gz".to_string(), sum)]);
        let mut d = descriptor();
        d.version = version.to_string();
        area.publish(&partial, &d, version, hashes).unwrap()
    }

    #[test]
    fn publish_makes_a_version_ready() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());
        let candidate = stage(&area, "1.2.0");

        assert_eq!(candidate.state, CandidateState::Ready);
        assert!(area.is_ready("1.2.0"));
        assert!(!area.partial_dir("1.2.0").exists());
        assert_eq!(candidate.assets[0].path, area.version_dir("1.2.0").join("capture.tar.gz"));
        area.reverify(&candidate).unwrap();
    }

    #[test]
    fn directory_without_marker_is_not_ready_and_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());
        fs::create_dir_all(area.version_dir("1.3.0")).unwrap();
        fs::create_dir_all(area.partial_dir("1.4.0")).unwrap();
        stage(&area, "1.2.0");

        assert!(!area.is_ready("1.3.0"));
        assert!(matches!(
            area.ready_candidate("1.3.0"),
            Err(ReleaseError::NotReady(_))
        ));
        assert_eq!(area.sweep().unwrap(), 2);
        assert!(area.is_ready("1.2.0"));
    }

    #[test]
    fn latest_ready_orders_by_semver() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());
        stage(&area, "1.10.0");
        stage(&area, "1.9.3");
        assert_eq!(area.latest_ready().unwrap().unwrap().version, "1.10.0");
    }

    #[test]
    fn tampered_asset_fails_reverification() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());
        let candidate = stage(&area, "1.2.0");
        fs::write(&candidate.assets[0].path, b"swapped").unwrap();
        assert!(matches!(
            area.reverify(&candidate),
            Err(ReleaseError::VerificationFailed { .. })
        ));
    }
}
