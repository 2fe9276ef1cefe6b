//! Transports that release artifacts are fetched over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ReleaseError, ReleaseResult, io_err};

/// Where descriptors, manifests and assets come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch a small document (descriptor or checksum manifest) into memory.
    async fn fetch_bytes(&self, uri: &str) -> ReleaseResult<Vec<u8>>;

    /// Stream an asset to `dest`, returning the number of bytes written.
    async fn download(&self, uri: &str, dest: &Path) -> ReleaseResult<u64>;
}

/// Default transport: `http(s)://` with an optional bearer token, plus
/// `file://` for mirrors on removable media.
pub struct ChannelTransport {
    client: reqwest::Client,
    token: Option<String>,
}

impl ChannelTransport {
    pub fn new(token: Option<String>, timeout: Duration) -> ReleaseResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReleaseError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, token })
    }

    /// Build a transport whose bearer token is read from `credential_file`.
    pub fn with_credential_file(
        credential_file: Option<&Path>,
        timeout: Duration,
    ) -> ReleaseResult<Self> {
        let token = credential_file
            .map(|path| {
                std::fs::read_to_string(path)
                    .map(|t| t.trim().to_string())
                    .map_err(|e| {
                        ReleaseError::Config(format!(
                            "failed to read credential file {}: {e}",
                            path.display()
                        ))
                    })
            })
            .transpose()?;
        Self::new(token, timeout)
    }

    async fn get(&self, uri: &str) -> ReleaseResult<reqwest::Response> {
        let mut req = self.client.get(uri);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        req.send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|e| ReleaseError::transport(uri, e))
    }
}

fn local_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

/// `https://` and `file://` always; plain `http://` only without a bearer
/// token, so credentials never leave the device in cleartext.
fn check_scheme(uri: &str, authenticated: bool) -> ReleaseResult<()> {
    if uri.starts_with("https://") || uri.starts_with("file://") {
        Ok(())
    } else if uri.starts_with("http://") {
        if authenticated {
            Err(ReleaseError::transport(
                uri,
                "refusing to send credentials over plain http",
            ))
        } else {
            Ok(())
        }
    } else {
        Err(ReleaseError::transport(uri, "unsupported scheme"))
    }
}

#[async_trait]
impl ReleaseSource for ChannelTransport {
    async fn fetch_bytes(&self, uri: &str) -> ReleaseResult<Vec<u8>> {
        check_scheme(uri, self.token.is_some())?;
        if let Some(path) = local_path(uri) {
            return tokio::fs::read(&path)
                .await
                .map_err(|e| ReleaseError::transport(uri, e));
        }
        let res = self.get(uri).await?;
        let bytes = res.bytes().await.map_err(|e| ReleaseError::transport(uri, e))?;
        debug!(uri, bytes = bytes.len(), "fetched document");
        Ok(bytes.to_vec())
    }

    async fn download(&self, uri: &str, dest: &Path) -> ReleaseResult<u64> {
        check_scheme(uri, self.token.is_some())?;
        if let Some(path) = local_path(uri) {
            return tokio::fs::copy(&path, dest)
                .await
                .map_err(|e| ReleaseError::transport(uri, e));
        }
        let mut res = self.get(uri).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(io_err(format!("failed to create {}", dest.display())))?;
        let mut written = 0u64;
        while let Some(chunk) = res.chunk().await.map_err(|e| ReleaseError::transport(uri, e))? {
            file.write_all(&chunk)
                .await
                .map_err(io_err(format!("failed to write {}", dest.display())))?;
            written += chunk.len() as u64;
        }
        file.sync_all()
            .await
            .map_err(io_err(format!("failed to sync {}", dest.display())))?;
        debug!(uri, bytes = written, "downloaded asset");
        Ok(written)
    }
}
