//! Release descriptors published per channel.

use std::collections::BTreeSet;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, ReleaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetRole {
    /// Installed tree content. Tarballs are unpacked, anything else copied.
    Payload,
    /// A service unit definition.
    Unit,
    /// Executable run after the payload is in place.
    Hook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub name: String,
    pub uri: String,
    pub role: AssetRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDescriptor {
    pub version: String,
    pub assets: Vec<AssetRef>,
    pub checksum_manifest: String,
}

impl ReleaseDescriptor {
    /// Parse and validate a descriptor document.
    pub fn parse(bytes: &[u8]) -> ReleaseResult<Self> {
        let descriptor: ReleaseDescriptor = serde_json::from_slice(bytes)
            .map_err(|e| ReleaseError::InvalidDescriptor(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> ReleaseResult<Version> {
        let version = parse_version(&self.version)?;
        if self.assets.is_empty() {
            return Err(ReleaseError::InvalidDescriptor(format!(
                "release {version} lists no assets"
            )));
        }
        if self.checksum_manifest.trim().is_empty() {
            return Err(ReleaseError::InvalidDescriptor(
                "checksum manifest location is empty".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for asset in &self.assets {
            if !is_plain_name(&asset.name) {
                return Err(ReleaseError::InvalidDescriptor(format!(
                    "asset name {:?} is not a plain file name",
                    asset.name
                )));
            }
            if !names.insert(asset.name.as_str()) {
                return Err(ReleaseError::InvalidDescriptor(format!(
                    "asset {:?} listed twice",
                    asset.name
                )));
            }
            if asset.uri.trim().is_empty() {
                return Err(ReleaseError::InvalidDescriptor(format!(
                    "asset {:?} has no location",
                    asset.name
                )));
            }
        }
        if self.assets.iter().filter(|a| a.role == AssetRole::Hook).count() > 1 {
            return Err(ReleaseError::InvalidDescriptor(
                "at most one hook asset is allowed".to_string(),
            ));
        }
        Ok(version)
    }

    /// Canonical version string, used as the staging directory name.
    pub fn canonical_version(&self) -> ReleaseResult<String> {
        parse_version(&self.version).map(|v| v.to_string())
    }
}

/// Parse a version tag, accepting an optional leading `v`.
pub fn parse_version(tag: &str) -> ReleaseResult<Version> {
    let trimmed = tag.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare)
        .map_err(|e| ReleaseError::InvalidDescriptor(format!("version {tag:?} is not semver: {e}")))
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Resolve an asset location against the descriptor's own location.
/// Absolute URIs are returned unchanged.
pub fn resolve_uri(descriptor_uri: &str, reference: &str) -> String {
    if reference.contains("://") {
        return reference.to_string();
    }
    match descriptor_uri.rfind('/') {
        Some(idx) => format!("{}/{}", &descriptor_uri[..idx], reference.trim_start_matches("./")),
        None => reference.to_string(),
    }
}
