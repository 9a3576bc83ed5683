//! ClamAV integration
//!
//! `clamscan` does the detection; `sigtool` reports the signature database
//! version. Both are invoked as external processes with the run's timeout.

use crate::config::ClamAvSettings;
use crate::error::{LayerscanError, Result};
use crate::extract::{layer_stats, ExtractedLayer};
use crate::fingerprint::{parse_engine_version, parse_signature_version, Fingerprint, FingerprintProvider};
use crate::process;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

const FOUND_SUFFIX: &str = " FOUND";

/// Runs the signature scanner over one extracted layer
pub trait LayerScanner: Sync {
    /// Scan `layer`, writing the scanner log to `log_path`.
    ///
    /// Returns the findings, empty when the layer is clean.
    fn scan_layer(&self, layer: &ExtractedLayer, log_path: &Path) -> anyhow::Result<Vec<String>>;
}

/// The ClamAV command-line tools
#[derive(Debug, Clone)]
pub struct ClamAv {
    settings: ClamAvSettings,
    timeout: Duration,
}

impl ClamAv {
    pub fn new(settings: ClamAvSettings, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    fn query(&self, cmd: &mut Command, what: &str) -> Result<String> {
        process::run(cmd, None, self.timeout)
            .and_then(|out| out.check(what))
            .map(|out| out.stdout)
            .map_err(|e| LayerscanError::Environment(format!("{} failed: {:#}", what, e)))
    }
}

impl FingerprintProvider for ClamAv {
    fn fingerprint(&self) -> Result<Fingerprint> {
        let version = self.query(
            Command::new(&self.settings.clamscan).arg("--version"),
            "clamscan --version",
        )?;
        let mut info_arg = std::ffi::OsString::from("--info=");
        info_arg.push(&self.settings.signature_db);
        let info = self.query(Command::new(&self.settings.sigtool).arg(info_arg), "sigtool --info")?;

        Ok(Fingerprint::new(
            parse_engine_version(&version)?,
            parse_signature_version(&info)?,
        ))
    }
}

impl LayerScanner for ClamAv {
    fn scan_layer(&self, layer: &ExtractedLayer, log_path: &Path) -> anyhow::Result<Vec<String>> {
        let mut log_arg = std::ffi::OsString::from("--log=");
        log_arg.push(log_path);

        let out = process::run(
            Command::new(&self.settings.clamscan)
                .args(["--recursive", "--verbose"])
                .arg(log_arg)
                .arg(&layer.path),
            None,
            self.timeout,
        )
        .with_context(|| format!("Failed to scan layer {}", layer.id))?;

        // 0: clean, 1: infections found, anything else: scanner error
        match out.code() {
            0 | 1 => {
                let findings = parse_findings(&out.stdout);
                debug!(layer = %layer.id, findings = findings.len(), "layer scanned");
                Ok(findings)
            }
            code => Err(anyhow!(
                "clamscan exited with status {} on layer {}: {}",
                code,
                layer.id,
                out.stderr.trim()
            )),
        }
    }
}

/// `path: Signature FOUND` lines, with the trailing marker removed
pub fn parse_findings(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim_end().strip_suffix(FOUND_SUFFIX))
        .map(str::to_string)
        .collect()
}

/// Metadata appended to each layer's scanner log
#[derive(Debug, Clone)]
pub struct LogAnnotation<'a> {
    pub layer: &'a ExtractedLayer,
    pub scan_time: DateTime<Utc>,
    pub fingerprint: &'a Fingerprint,
}

/// Append layer id, scan time, scanner versions and layer size to the log
pub fn annotate_log(log_path: &Path, note: &LogAnnotation<'_>) -> anyhow::Result<()> {
    let (files, bytes) = layer_stats(&note.layer.path);
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open scan log {}", log_path.display()))?;

    writeln!(log, "Layer ID: {}", note.layer.id)?;
    writeln!(log, "Scan Time: {}", note.scan_time.to_rfc3339())?;
    writeln!(log, "ClamAV Version: {}", note.fingerprint.engine_version)?;
    writeln!(log, "ClamAV Definitions: {}", note.fingerprint.signature_version)?;
    writeln!(log, "Layer Files: {}", files)?;
    writeln!(log, "Layer Size: {}", bytesize::to_string(bytes, true))?;
    Ok(())
}
