//! Per-run layer bookkeeping

use std::collections::{HashMap, HashSet};

/// Outcome of asking the registry whether a layer still needs a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Already covered, by a trusted report or earlier in this run
    Covered,
    /// The caller owns the scan and must call `finish_scan` or `abandon_scan`
    Scan,
    /// Another worker is scanning it right now
    InFlight,
}

/// Reference counts and scan coverage for every layer seen in a run
///
/// - `counts` holds how many images processed so far list each layer,
///   whether the layer was scanned or skipped
/// - `scanned` holds layers that must not be scanned again this run
/// - `in_flight` holds layers claimed by a worker whose scan has not ended
#[derive(Debug, Default, Clone)]
pub struct LayerRegistry {
    counts: HashMap<String, usize>,
    scanned: HashSet<String>,
    in_flight: HashSet<String>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run with layers already covered by a trusted report
    pub fn with_scanned(scanned: HashSet<String>) -> Self {
        Self {
            scanned,
            ..Self::default()
        }
    }

    /// Record that one more image contains `layer_id`
    pub fn touch(&mut self, layer_id: &str) -> usize {
        let count = self.counts.entry(layer_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reference_count(&self, layer_id: &str) -> usize {
        self.counts.get(layer_id).copied().unwrap_or(0)
    }

    pub fn was_scanned(&self, layer_id: &str) -> bool {
        self.scanned.contains(layer_id)
    }

    pub fn mark_scanned(&mut self, layer_id: &str) {
        self.scanned.insert(layer_id.to_string());
    }

    /// Check-and-claim in one step.
    ///
    /// Parallel callers must hold the registry lock across this call so two
    /// workers can never both get `Claim::Scan` for the same layer.
    pub fn claim(&mut self, layer_id: &str) -> Claim {
        if self.was_scanned(layer_id) {
            Claim::Covered
        } else if self.in_flight.insert(layer_id.to_string()) {
            Claim::Scan
        } else {
            Claim::InFlight
        }
    }

    /// The claimed scan completed
    pub fn finish_scan(&mut self, layer_id: &str) {
        self.in_flight.remove(layer_id);
        self.mark_scanned(layer_id);
    }

    /// The claimed scan failed; the layer may be claimed again
    pub fn abandon_scan(&mut self, layer_id: &str) {
        self.in_flight.remove(layer_id);
    }

    pub fn counts(&self) -> &HashMap<String, usize> {
        &self.counts
    }

    pub fn scanned_len(&self) -> usize {
        self.scanned.len()
    }
}
