//! `sha256sum`-format checksum manifests.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ReleaseError, ReleaseResult};

// `<64 hex>  <name>` or `<64 hex> *<name>` (binary mode marker).
static LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sum>[0-9a-fA-F]{64}) [ *](?P<name>\S.*)$").expect("valid regex")
});

/// Expected digest per asset name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, String>,
}

impl ChecksumManifest {
    /// Parse manifest text. Blank lines and `#` comments are ignored; any
    /// other malformed line rejects the whole manifest.
    pub fn parse(version: &str, text: &str) -> ReleaseResult<Self> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let caps = LINE.captures(line).ok_or_else(|| {
                ReleaseError::VerificationFailed {
                    version: version.to_string(),
                    reason: format!("malformed checksum manifest line {}", idx + 1),
                }
            })?;
            let name = caps["name"].to_string();
            let sum = caps["sum"].to_ascii_lowercase();
            if entries.insert(name.clone(), sum).is_some() {
                return Err(ReleaseError::VerificationFailed {
                    version: version.to_string(),
                    reason: format!("checksum manifest lists {name:?} twice"),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
