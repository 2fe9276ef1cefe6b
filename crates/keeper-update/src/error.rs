//! Error types for update transactions.

use std::io;

use keeper_archive::ArchiveError;
use keeper_core::ErrorClass;
use keeper_health::SupervisorError;
use keeper_release::ReleaseError;
use thiserror::Error;

use crate::state::TxState;

/// Result type alias for update operations.
pub type UpdateResult<T> = Result<T, UpdateError>;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid update configuration: {0}")]
    Config(String),

    #[error("an update transaction is already running")]
    Busy,

    /// Precheck or snapshot failed; nothing was stopped or changed.
    #[error("update aborted during {stage}: {reason}")]
    Aborted {
        stage: TxState,
        reason: String,
        class: ErrorClass,
    },

    /// Rollback itself failed. The installed tree may be inconsistent.
    #[error("rollback failed, manual intervention required: {0}")]
    Critical(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("applying release failed: {0}")]
    Apply(String),

    #[error("post-apply hook {hook} failed: {reason}")]
    Hook { hook: String, reason: String },

    #[error("unit {0} is not active after start")]
    Inactive(String),

    #[error("health probe did not pass within {0:?}")]
    Unhealthy(std::time::Duration),

    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },

    #[error("background task failed: {0}")]
    Task(String),
}

impl UpdateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpdateError::Config(_) => ErrorClass::Config,
            UpdateError::Busy | UpdateError::Io { .. } | UpdateError::Task(_) => {
                ErrorClass::Resource
            }
            UpdateError::Aborted { class, .. } => *class,
            UpdateError::Critical(_) => ErrorClass::Critical,
            UpdateError::Archive(e) => e.class(),
            UpdateError::Release(e) => e.class(),
            UpdateError::Supervisor(_)
            | UpdateError::Apply(_)
            | UpdateError::Hook { .. }
            | UpdateError::Inactive(_)
            | UpdateError::Unhealthy(_) => ErrorClass::Transaction,
        }
    }
}

pub(crate) fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> UpdateError {
    let context = context.into();
    move |source| UpdateError::Io { context, source }
}
