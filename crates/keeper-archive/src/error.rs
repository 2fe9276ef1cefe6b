//! Error types for the keeper archiver.

use std::io;
use std::path::PathBuf;

use keeper_core::ErrorClass;
use thiserror::Error;

/// Result type alias for archiver operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors that can occur while archiving, pruning or restoring.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid archive configuration: {0}")]
    Config(String),

    #[error("target path does not exist: {}", .0.display())]
    MissingTarget(PathBuf),

    #[error(
        "insufficient space at {}: need {needed} bytes, {available} available",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("another keeper run holds {}", .0.display())]
    Busy(PathBuf),

    #[error("integrity check failed for {}: {reason}", .path.display())]
    Integrity { path: PathBuf, reason: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("archive not found in chain: {0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[cfg(test)]
    #[error("run interrupted before publish")]
    Interrupted,
}

impl ArchiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ArchiveError::Config(_) | ArchiveError::MissingTarget(_) | ArchiveError::NotFound(_) => {
                ErrorClass::Config
            }
            ArchiveError::InsufficientSpace { .. }
            | ArchiveError::Busy(_)
            | ArchiveError::Io { .. }
            | ArchiveError::Serialize(_)
            | ArchiveError::Task(_) => ErrorClass::Resource,
            ArchiveError::Integrity { .. } => ErrorClass::Integrity,
            ArchiveError::Transfer(_) => ErrorClass::Transfer,
            #[cfg(test)]
            ArchiveError::Interrupted => ErrorClass::Resource,
        }
    }

    pub(crate) fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ArchiveError::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Wrap an `io::Error` with a description of what was being attempted.
pub(crate) fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> ArchiveError {
    let context = context.into();
    move |source| ArchiveError::Io { context, source }
}
