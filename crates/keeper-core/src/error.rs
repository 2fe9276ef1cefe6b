//! Error classes shared by every keeper crate.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse failure taxonomy. Every crate-level error maps onto exactly one
/// class so callers can decide between retrying, rolling back and paging an
/// operator without matching on crate-specific variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Invalid settings or missing inputs. Raised before any mutation.
    Config,
    /// Precondition on disk space or exclusivity not met. No partial state.
    Resource,
    /// Checksum or read-back mismatch. The offending artifact is discarded.
    Integrity,
    /// Remote upload/download failed. Local state stays valid.
    Transfer,
    /// A mutating update step failed; handled by rollback.
    Transaction,
    /// Rollback itself failed. Needs an operator.
    Critical,
}

impl ErrorClass {
    /// Process exit code used by the keeper binaries.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Config => 2,
            ErrorClass::Resource => 3,
            ErrorClass::Integrity => 4,
            ErrorClass::Transfer => 5,
            ErrorClass::Transaction => 6,
            ErrorClass::Critical => 70,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Config => "config",
            ErrorClass::Resource => "resource",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Transfer => "transfer",
            ErrorClass::Transaction => "transaction",
            ErrorClass::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Errors raised while loading or validating `keeper.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Config
    }
}
