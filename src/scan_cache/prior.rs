//! Seeding the scanned set from a previous run's report

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::report::Report;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// What to do when the previous report cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BadReportPolicy {
    /// Abort the run with `ReportParse`
    #[default]
    Fail,
    /// Log the problem and scan every layer
    FullScan,
}

/// Why the scanned set looks the way it does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// No previous report configured
    NoPriorReport,
    /// Report was unreadable and the policy allowed a full scan
    Unreadable { reason: String },
    /// Scanner engine or signatures changed since the previous run
    Stale { previous: Fingerprint },
    /// Fingerprint matched; `layers` layers are skipped
    Trusted { layers: usize },
}

/// Layers covered before the run starts
#[derive(Debug, Clone)]
pub struct PriorState {
    pub status: CacheStatus,
    pub scanned: HashSet<String>,
    /// Findings for carried-over layers, so cache hits still report them
    pub infected: BTreeMap<String, Vec<String>>,
}

impl PriorState {
    pub fn empty(status: CacheStatus) -> Self {
        Self {
            status,
            scanned: HashSet::new(),
            infected: BTreeMap::new(),
        }
    }

    pub fn is_full_scan(&self) -> bool {
        self.scanned.is_empty()
    }
}

/// Load the previous report (if any) and decide which layers to trust
pub fn load_prior_state(
    path: Option<&Path>,
    current: &Fingerprint,
    policy: BadReportPolicy,
) -> Result<PriorState> {
    let Some(path) = path else {
        info!("no previous report configured, running full scan");
        return Ok(PriorState::empty(CacheStatus::NoPriorReport));
    };

    match Report::load(path) {
        Ok(report) => Ok(seed_from_report(&report, current)),
        Err(e) if policy == BadReportPolicy::FullScan => {
            warn!(error = %e, "previous report unusable, forcing full scan");
            Ok(PriorState::empty(CacheStatus::Unreadable {
                reason: e.to_string(),
            }))
        }
        Err(e) => Err(e),
    }
}

/// Trust the report's layers only when both fingerprint parts match
pub fn seed_from_report(report: &Report, current: &Fingerprint) -> PriorState {
    if report.fingerprint != *current {
        info!(
            previous = %report.fingerprint,
            current = %current,
            "scanner version or signatures changed, running full scan"
        );
        return PriorState::empty(CacheStatus::Stale {
            previous: report.fingerprint.clone(),
        });
    }

    let scanned: HashSet<String> = report.all_layers().map(str::to_string).collect();
    let infected = report
        .infected_layers
        .iter()
        .filter(|(layer, _)| scanned.contains(layer.as_str()))
        .map(|(layer, findings)| (layer.clone(), findings.clone()))
        .collect();

    info!(layers = scanned.len(), "fingerprint unchanged, skipping previously scanned layers");
    PriorState {
        status: CacheStatus::Trusted {
            layers: scanned.len(),
        },
        scanned,
        infected,
    }
}
