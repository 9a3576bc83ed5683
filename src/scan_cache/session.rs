//! Scan session statistics

use serde::{Deserialize, Serialize};

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub images: usize,
    pub failed_images: usize,
    /// Every (image, layer) pair seen
    pub layers_seen: usize,
    pub layers_scanned: usize,
    pub cache_hits: usize,
    pub infected_layers: usize,
}

impl ScanStats {
    /// Fold another worker's counters into this one
    pub fn merge(&mut self, other: &ScanStats) {
        self.images += other.images;
        self.failed_images += other.failed_images;
        self.layers_seen += other.layers_seen;
        self.layers_scanned += other.layers_scanned;
        self.cache_hits += other.cache_hits;
        self.infected_layers += other.infected_layers;
    }

    /// "full" when nothing was skipped, "incremental" otherwise
    pub fn scan_type(&self) -> &'static str {
        if self.cache_hits == 0 {
            "full"
        } else {
            "incremental"
        }
    }
}
