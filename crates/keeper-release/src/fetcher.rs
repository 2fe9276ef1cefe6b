//! Channel resolution and verified staging of releases.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keeper_core::ReleaseConfig;
use tracing::{debug, info, warn};

use crate::descriptor::{ReleaseDescriptor, parse_version, resolve_uri};
use crate::error::{ReleaseError, ReleaseResult};
use crate::manifest::ChecksumManifest;
use crate::source::ReleaseSource;
use crate::staging::{CandidateState, ReleaseCandidate, StagingArea};

/// Which release a channel tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    /// Canonical semver string (no `v` prefix).
    Exact(String),
}

impl VersionSelector {
    pub fn parse(s: &str) -> ReleaseResult<Self> {
        if s.trim().eq_ignore_ascii_case("latest") {
            return Ok(VersionSelector::Latest);
        }
        parse_version(s)
            .map(|v| VersionSelector::Exact(v.to_string()))
            .map_err(|e| ReleaseError::Config(e.to_string()))
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Exact(v) => f.write_str(v),
        }
    }
}

/// A release channel: where descriptors are published and which one to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub endpoint: String,
    pub version: VersionSelector,
    pub credential_file: Option<PathBuf>,
}

impl Channel {
    pub fn from_config(cfg: &ReleaseConfig) -> ReleaseResult<Self> {
        if cfg.channel.trim().is_empty() || cfg.channel.contains('/') {
            return Err(ReleaseError::Config(format!(
                "channel name {:?} is invalid",
                cfg.channel
            )));
        }
        Ok(Self {
            name: cfg.channel.clone(),
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            version: VersionSelector::parse(&cfg.version)?,
            credential_file: cfg.credential_file.clone(),
        })
    }

    /// `<endpoint>/<channel>/latest.json`, or
    /// `<endpoint>/<channel>/<version>/release.json` for a pinned version.
    pub fn descriptor_uri(&self) -> String {
        match &self.version {
            VersionSelector::Latest => format!("{}/{}/latest.json", self.endpoint, self.name),
            VersionSelector::Exact(v) => {
                format!("{}/{}/{v}/release.json", self.endpoint, self.name)
            }
        }
    }
}

/// Fetches releases into a [`StagingArea`].
pub struct ReleaseFetcher {
    source: Arc<dyn ReleaseSource>,
    staging: StagingArea,
}

impl ReleaseFetcher {
    pub fn new(source: Arc<dyn ReleaseSource>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            staging: StagingArea::new(staging_dir),
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Resolve, download and verify the channel's release.
    ///
    /// A version that is already Ready is returned as is. For a pinned
    /// version that check happens before any transport call.
    pub async fn fetch(&self, channel: &Channel) -> ReleaseResult<ReleaseCandidate> {
        self.fetch_wanted(channel, |_| true)
            .await?
            .ok_or(ReleaseError::NotReady(None))
    }

    /// Like [`fetch`](Self::fetch), but asks `wanted` about the resolved
    /// version before downloading anything and returns `None` when it
    /// declines. A version that is already Ready is returned regardless.
    pub async fn fetch_wanted(
        &self,
        channel: &Channel,
        wanted: impl Fn(&str) -> bool,
    ) -> ReleaseResult<Option<ReleaseCandidate>> {
        if let VersionSelector::Exact(version) = &channel.version {
            if self.staging.is_ready(version) {
                info!(channel = %channel.name, version, "release already staged");
                return self.staging.ready_candidate(version).map(Some);
            }
            if !wanted(version) {
                debug!(channel = %channel.name, version, "pinned release not wanted, skipping");
                return Ok(None);
            }
        }

        let descriptor_uri = channel.descriptor_uri();
        info!(channel = %channel.name, uri = %descriptor_uri, "resolving release");
        let bytes = self.source.fetch_bytes(&descriptor_uri).await?;
        let mut descriptor = ReleaseDescriptor::parse(&bytes)?;
        let version = descriptor.canonical_version()?;
        if let VersionSelector::Exact(pinned) = &channel.version {
            if *pinned != version {
                return Err(ReleaseError::InvalidDescriptor(format!(
                    "descriptor at {descriptor_uri} is for {version}, not {pinned}"
                )));
            }
        }
        if self.staging.is_ready(&version) {
            info!(channel = %channel.name, %version, "release already staged");
            return self.staging.ready_candidate(&version).map(Some);
        }
        if !wanted(&version) {
            debug!(channel = %channel.name, %version, "resolved release not wanted, skipping");
            return Ok(None);
        }

        for asset in &mut descriptor.assets {
            asset.uri = resolve_uri(&descriptor_uri, &asset.uri);
        }
        descriptor.checksum_manifest = resolve_uri(&descriptor_uri, &descriptor.checksum_manifest);

        let partial = self.staging.begin(&version)?;
        match self.download_and_verify(&descriptor, &version, &partial).await {
            Ok(hashes) => self
                .staging
                .publish(&partial, &descriptor, &version, hashes)
                .map(Some),
            Err(e) => {
                if let Err(cleanup) = self.staging.discard(&version) {
                    warn!(%version, error = %cleanup, "failed to discard partial download");
                }
                if matches!(e, ReleaseError::VerificationFailed { .. }) {
                    warn!(%version, state = %CandidateState::Rejected, error = %e, "release rejected");
                }
                Err(e)
            }
        }
    }

    async fn download_and_verify(
        &self,
        descriptor: &ReleaseDescriptor,
        version: &str,
        partial: &Path,
    ) -> ReleaseResult<BTreeMap<String, String>> {
        info!(%version, assets = descriptor.assets.len(), state = %CandidateState::Fetching, "downloading release");
        for asset in &descriptor.assets {
            self.source
                .download(&asset.uri, &partial.join(&asset.name))
                .await?;
        }
        let manifest_bytes = self.source.fetch_bytes(&descriptor.checksum_manifest).await?;

        info!(%version, state = %CandidateState::Verifying, "verifying release");
        let rejected = |reason: String| ReleaseError::VerificationFailed {
            version: version.to_string(),
            reason,
        };
        let text = String::from_utf8(manifest_bytes)
            .map_err(|_| rejected("checksum manifest is not UTF-8".to_string()))?;
        let manifest = ChecksumManifest::parse(version, &text)?;

        let names: Vec<String> = descriptor.assets.iter().map(|a| a.name.clone()).collect();
        let dir = partial.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || {
            names
                .into_iter()
                .map(|name| {
                    let sum = keeper_core::fsutil::sha256_file(&dir.join(&name));
                    (name, sum)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| rejected(format!("hashing task failed: {e}")))?;

        let mut hashes = BTreeMap::new();
        for (name, sum) in actual {
            let sum = sum.map_err(|e| rejected(format!("{name}: {e}")))?;
            let expected = manifest
                .get(&name)
                .ok_or_else(|| rejected(format!("{name} is not listed in the checksum manifest")))?;
            if expected != sum {
                return Err(rejected(format!(
                    "{name}: expected {expected}, got {sum}"
                )));
            }
            hashes.insert(name, sum);
        }
        Ok(hashes)
    }
}
