//! Off-box copies of published archives.
//!
//! Uploads never fail a backup. Archives that could not be shipped stay in a
//! small ledger under the state directory and are retried on the next run.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keeper_core::{RemoteConfig, RemoteProtocol};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, ArchiveResult, io_err};
use crate::format::checksum_path;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of a transfer attempt, reported alongside the backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum TransferOutcome {
    /// No remote configured.
    Skipped,
    Uploaded { archives: Vec<String> },
    Failed { reason: String, pending: usize },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    pending: BTreeSet<String>,
}

/// Names of published archives not yet confirmed remotely.
#[derive(Debug, Clone)]
pub struct TransferLedger {
    path: PathBuf,
}

impl TransferLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn pending(&self) -> BTreeSet<String> {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<LedgerFile>(&bytes) {
                Ok(file) => file.pending,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "ignoring unreadable transfer ledger");
                    BTreeSet::new()
                }
            },
            Err(_) => BTreeSet::new(),
        }
    }

    fn store(&self, pending: &BTreeSet<String>) -> ArchiveResult<()> {
        let json = serde_json::to_vec_pretty(&LedgerFile {
            pending: pending.clone(),
        })
        .map_err(|e| ArchiveError::Serialize(e.to_string()))?;
        keeper_core::fsutil::write_atomic(&self.path, &json)
            .map_err(io_err(format!("failed to write {}", self.path.display())))
    }
}

enum Target {
    Http {
        client: reqwest::Client,
        base: String,
        token: Option<String>,
    },
    Dir(PathBuf),
}

/// Ships archives and their sidecars to the configured remote.
pub struct RemoteTransfer {
    target: Target,
    ledger: TransferLedger,
}

impl RemoteTransfer {
    /// The credential file is read here, once; its contents never appear in
    /// configuration or logs.
    pub fn from_config(remote: &RemoteConfig, ledger: TransferLedger) -> ArchiveResult<Self> {
        let target = match remote.protocol {
            RemoteProtocol::Https => {
                let token = remote
                    .credential_file
                    .as_deref()
                    .map(read_credential)
                    .transpose()?;
                let client = reqwest::Client::builder()
                    .timeout(UPLOAD_TIMEOUT)
                    .build()
                    .map_err(|e| ArchiveError::Transfer(format!("failed to build HTTP client: {e}")))?;
                Target::Http {
                    client,
                    base: remote.endpoint.trim_end_matches('/').to_string(),
                    token,
                }
            }
            RemoteProtocol::File => {
                let dir = remote
                    .endpoint
                    .strip_prefix("file://")
                    .unwrap_or(&remote.endpoint);
                Target::Dir(PathBuf::from(dir))
            }
        };
        Ok(Self { target, ledger })
    }

    /// Queue `archive` and try to ship everything pending from `backup_dir`.
    pub async fn sync(&self, backup_dir: &Path, archive: Option<&str>) -> TransferOutcome {
        let mut pending = self.ledger.pending();
        if let Some(name) = archive {
            pending.insert(name.to_string());
        }
        // Archives pruned before they could be shipped are dropped.
        pending.retain(|name| backup_dir.join(name).is_file());

        let mut shipped = Vec::new();
        let mut failure = None;
        for name in pending.clone() {
            match self.push(&backup_dir.join(&name)).await {
                Ok(()) => {
                    pending.remove(&name);
                    shipped.push(name);
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if let Err(e) = self.ledger.store(&pending) {
            warn!(error = %e, "failed to record pending transfers");
        }
        match failure {
            Some(reason) => {
                warn!(%reason, pending = pending.len(), "remote transfer failed, will retry next run");
                TransferOutcome::Failed {
                    reason,
                    pending: pending.len(),
                }
            }
            None => {
                if !shipped.is_empty() {
                    info!(archives = shipped.len(), "archives transferred");
                }
                TransferOutcome::Uploaded { archives: shipped }
            }
        }
    }

    /// Ship one archive followed by its sidecar.
    async fn push(&self, archive: &Path) -> ArchiveResult<()> {
        self.push_file(archive).await?;
        self.push_file(&checksum_path(archive)).await
    }

    async fn push_file(&self, path: &Path) -> ArchiveResult<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchiveError::Transfer(format!("{} has no file name", path.display())))?;
        match &self.target {
            Target::Http {
                client,
                base,
                token,
            } => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| ArchiveError::Transfer(format!("failed to open {name}: {e}")))?;
                let mut req = client.put(format!("{base}/{name}")).body(file);
                if let Some(t) = token.as_deref() {
                    req = req.bearer_auth(t);
                }
                req.send()
                    .await
                    .and_then(|res| res.error_for_status())
                    .map_err(|e| ArchiveError::Transfer(format!("upload of {name} failed: {e}")))?;
            }
            Target::Dir(dir) => {
                let dest = dir.join(&name);
                let tmp = keeper_core::fsutil::temp_sibling(&dest);
                let copy = async {
                    tokio::fs::copy(path, &tmp).await?;
                    tokio::fs::File::open(&tmp).await?.sync_all().await?;
                    tokio::fs::rename(&tmp, &dest).await
                };
                if let Err(e) = copy.await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(ArchiveError::Transfer(format!(
                        "copy of {name} to {} failed: {e}",
                        dir.display()
                    )));
                }
            }
        }
        debug!(file = %name, "transferred");
        Ok(())
    }
}

fn read_credential(path: &Path) -> ArchiveResult<String> {
    let token = fs::read_to_string(path).map_err(|e: io::Error| {
        ArchiveError::Config(format!(
            "failed to read credential file {}: {e}",
            path.display()
        ))
    })?;
    Ok(token.trim().to_string())
}
