//! Scanner fingerprint: engine version plus signature database version
//!
//! The fingerprint decides whether a previous report can be trusted. It is
//! computed once per run and never changes afterwards.

use crate::error::{LayerscanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Detection capability of the scanner at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub engine_version: String,
    pub signature_version: String,
}

impl Fingerprint {
    pub fn new(engine_version: impl Into<String>, signature_version: impl Into<String>) -> Self {
        Self {
            engine_version: engine_version.into(),
            signature_version: signature_version.into(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine {} / signatures {}", self.engine_version, self.signature_version)
    }
}

/// Anything able to report the current scanner fingerprint
pub trait FingerprintProvider {
    fn fingerprint(&self) -> Result<Fingerprint>;
}

/// Extract the engine version from `clamscan --version` output.
///
/// The output looks like `ClamAV 0.103.8/26912/Mon Jun  5 07:27:12 2023`;
/// the version is the second token when splitting on whitespace and `/`.
pub fn parse_engine_version(output: &str) -> Result<String> {
    output
        .split(|c: char| c.is_whitespace() || c == '/')
        .filter(|s| !s.is_empty())
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| {
            LayerscanError::Environment(format!(
                "unrecognised scanner version output: {:?}",
                output.trim()
            ))
        })
}

/// Extract the database version from `sigtool --info` output.
///
/// Takes the first line starting with `Version` and returns its second
/// whitespace-separated token (`Version: 62` -> `62`).
pub fn parse_signature_version(output: &str) -> Result<String> {
    output
        .lines()
        .find(|line| line.starts_with("Version"))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .ok_or_else(|| {
            LayerscanError::Environment(
                "signature database info has no Version line".to_string(),
            )
        })
}
