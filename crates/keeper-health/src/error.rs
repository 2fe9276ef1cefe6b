//! Error types for service supervision.

use std::io;

use keeper_core::ErrorClass;
use thiserror::Error;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to run {command}: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("{action} {unit} failed (exit {}): {stderr}", .status.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        action: String,
        unit: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl SupervisorError {
    /// Supervisor failures only happen inside an update transaction.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Transaction
    }
}
