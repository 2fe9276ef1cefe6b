//! Error types for the release fetcher.

use std::io;

use keeper_core::ErrorClass;
use thiserror::Error;

/// Result type alias for release operations.
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Errors that can occur while resolving, downloading or staging a release.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("invalid release channel: {0}")]
    Config(String),

    #[error("invalid release descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("transfer of {uri} failed: {reason}")]
    Transport { uri: String, reason: String },

    #[error("release {version} failed verification: {reason}")]
    VerificationFailed { version: String, reason: String },

    #[error("no ready release staged{}", .0.as_deref().map(|v| format!(" for {v}")).unwrap_or_default())]
    NotReady(Option<String>),

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl ReleaseError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReleaseError::Config(_)
            | ReleaseError::InvalidDescriptor(_)
            | ReleaseError::NotReady(_) => ErrorClass::Config,
            ReleaseError::Transport { .. } => ErrorClass::Transfer,
            ReleaseError::VerificationFailed { .. } => ErrorClass::Integrity,
            ReleaseError::Io { .. } | ReleaseError::Serialize(_) => ErrorClass::Resource,
        }
    }

    pub(crate) fn transport(uri: &str, reason: impl ToString) -> Self {
        ReleaseError::Transport {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub(crate) fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> ReleaseError {
    let context = context.into();
    move |source| ReleaseError::Io { context, source }
}
