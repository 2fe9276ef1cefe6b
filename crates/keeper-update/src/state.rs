//! Transaction state machine and its persisted status mirror.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{UpdateError, UpdateResult, io_err};

/// Where an update transaction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxState {
    Idle,
    Precheck,
    Snapshotting,
    Stopping,
    Applying,
    Restarting,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    /// Rollback failed; the operator has to step in.
    Failed,
    /// Precheck or snapshot failed before anything was touched.
    Aborted,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxState::Idle
                | TxState::Committed
                | TxState::RolledBack
                | TxState::Failed
                | TxState::Aborted
        )
    }

    /// States in which a failure is handled by rolling back.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            TxState::Stopping | TxState::Applying | TxState::Restarting | TxState::Verifying
        )
    }

    /// Whether `self → next` is an edge of the transaction graph.
    pub fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        match (self, next) {
            (s, Precheck) if s.is_terminal() => true,
            (Precheck, Snapshotting) | (Precheck, Aborted) => true,
            (Snapshotting, Stopping) | (Snapshotting, Aborted) => true,
            (Stopping, Applying) | (Applying, Restarting) | (Restarting, Verifying) => true,
            (Verifying, Committed) => true,
            (s, RollingBack) if s.is_mutating() => true,
            (RollingBack, RolledBack) | (RollingBack, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Idle => "idle",
            TxState::Precheck => "precheck",
            TxState::Snapshotting => "snapshotting",
            TxState::Stopping => "stopping",
            TxState::Applying => "applying",
            TxState::Restarting => "restarting",
            TxState::Verifying => "verifying",
            TxState::Committed => "committed",
            TxState::RollingBack => "rolling-back",
            TxState::RolledBack => "rolled-back",
            TxState::Failed => "failed",
            TxState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by `status()` and mirrored to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStatus {
    pub state: TxState,
    pub last_error: Option<String>,
    /// Version of the transaction in flight or last finished.
    pub version: Option<String>,
    /// Last version that reached `Committed`.
    pub installed_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TxStatus {
    fn default() -> Self {
        Self {
            state: TxState::Idle,
            last_error: None,
            version: None,
            installed_version: None,
            updated_at: Utc::now(),
        }
    }
}

/// Atomic JSON mirror of [`TxStatus`] for other processes.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the mirror. A missing file is `None`; an unreadable one is
    /// logged and treated the same way.
    pub fn load(&self) -> Option<TxStatus> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "update status unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "update status corrupt, ignoring");
                None
            }
        }
    }

    pub fn persist(&self, status: &TxStatus) -> UpdateResult<()> {
        let json = serde_json::to_vec_pretty(status).map_err(|e| {
            UpdateError::Io {
                context: "failed to encode update status".to_string(),
                source: io::Error::other(e),
            }
        })?;
        keeper_core::fsutil::write_atomic(&self.path, &json)
            .map_err(io_err(format!("failed to write {}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_a_chain_of_valid_edges() {
        let path = [
            TxState::Idle,
            TxState::Precheck,
            TxState::Snapshotting,
            TxState::Stopping,
            TxState::Applying,
            TxState::Restarting,
            TxState::Verifying,
            TxState::Committed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn rollback_only_from_mutating_states() {
        for s in [
            TxState::Stopping,
            TxState::Applying,
            TxState::Restarting,
            TxState::Verifying,
        ] {
            assert!(s.can_transition_to(TxState::RollingBack));
        }
        for s in [TxState::Precheck, TxState::Snapshotting, TxState::Committed] {
            assert!(!s.can_transition_to(TxState::RollingBack));
        }
        assert!(TxState::RollingBack.can_transition_to(TxState::Failed));
        assert!(!TxState::Applying.can_transition_to(TxState::Committed));
    }

    #[test]
    fn new_transaction_starts_from_any_terminal_state() {
        for s in [TxState::Idle, TxState::Aborted, TxState::Failed, TxState::RolledBack] {
            assert!(s.can_transition_to(TxState::Precheck));
        }
        assert!(!TxState::Verifying.can_transition_to(TxState::Precheck));
    }

    #[test]
    fn status_mirror_round_trips_and_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("update-status.json"));
        assert!(store.load().is_none());

        let status = TxStatus {
            state: TxState::RolledBack,
            last_error: Some("hook exited 1".to_string()),
            version: Some("1.4.0".to_string()),
            installed_version: Some("1.3.2".to_string()),
            ..TxStatus::default()
        };
        store.persist(&status).unwrap();
        assert_eq!(store.load(), Some(status));

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"rolledBack\""));
        assert!(raw.contains("installedVersion"));

        fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().is_none());
    }
}
