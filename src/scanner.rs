//! Scan orchestration
//!
//! Drives every image through acquisition, extraction and per-layer scanning
//! while the shared [`LayerRegistry`] guarantees each layer is scanned at most
//! once per run. A failure in one image is recorded against that image and
//! the run moves on.

use crate::clamav::{annotate_log, LayerScanner, LogAnnotation};
use crate::docker::{sanitize_image_name, ImageSource};
use crate::extract::{ExtractedLayer, Extractor};
use crate::output::OutputMode;
use crate::progress;
use crate::report::{ImageResult, Report};
use crate::scan_cache::{Claim, LayerRegistry, PriorState, ScanStats};
use crate::uniqueness;
use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::ProgressBar;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// External tools the orchestrator drives
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub source: &'a dyn ImageSource,
    pub extractor: &'a dyn Extractor,
    pub scanner: &'a dyn LayerScanner,
}

/// Where scan artifacts go and how much runs at once
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Per-layer scanner logs are written here
    pub report_dir: PathBuf,
    /// Each image gets its own scratch directory under here for its archive
    /// and extracted layers
    pub temp_dir: PathBuf,
    /// Remove an image's scratch directory once the image is done
    pub cleanup: bool,
    pub jobs: usize,
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunOutcome {
    /// Uniqueness already resolved; not yet finalized or saved
    pub report: Report,
    pub registry: LayerRegistry,
    pub stats: ScanStats,
}

/// Per-run scan state shared by all workers
pub struct Orchestrator<'a> {
    collab: Collaborators<'a>,
    settings: ScanSettings,
    /// Carries the fingerprint and the run's begin time; images land here
    report: Report,
    registry: Mutex<LayerRegistry>,
    /// Signalled whenever an in-flight layer scan ends
    scan_done: Condvar,
    infected: Mutex<BTreeMap<String, Vec<String>>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        collab: Collaborators<'a>,
        settings: ScanSettings,
        report: Report,
        prior: PriorState,
    ) -> Self {
        Self {
            collab,
            settings,
            report,
            registry: Mutex::new(LayerRegistry::with_scanned(prior.scanned)),
            scan_done: Condvar::new(),
            infected: Mutex::new(prior.infected),
        }
    }

    /// Scan every image, in list order, and resolve uniqueness
    pub fn run(self, images: &[String], mode: OutputMode) -> RunOutcome {
        let bar = if mode != OutputMode::Quiet && !images.is_empty() {
            Some(progress::create_progress_bar(images.len() as u64, "Scanning images..."))
        } else {
            None
        };

        let results = self.process_all(images, bar.as_ref());

        if let Some(ref pb) = bar {
            progress::finish_and_clear(pb);
        }

        let mut report = self.report;
        let mut stats = ScanStats::default();
        for (result, image_stats) in results {
            stats.merge(&image_stats);
            report.push(result);
        }

        let registry = self
            .registry
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let shared = uniqueness::resolve(&mut report.images, &registry);

        let mut infected = self
            .infected
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only layers that belong to this run's images
        infected.retain(|layer, _| registry.reference_count(layer) > 0);
        stats.infected_layers = infected.len();
        report.infected_layers = infected;

        info!(
            images = stats.images,
            failed = stats.failed_images,
            scanned = stats.layers_scanned,
            cache_hits = stats.cache_hits,
            shared_images = shared,
            "scan finished"
        );

        RunOutcome {
            report,
            registry,
            stats,
        }
    }

    fn process_all(&self, images: &[String], bar: Option<&ProgressBar>) -> Vec<(ImageResult, ScanStats)> {
        let work = |(index, image): (usize, &String)| {
            let outcome = self.process_image(index, image);
            if let Some(pb) = bar {
                pb.inc(1);
            }
            outcome
        };

        if self.settings.jobs <= 1 || images.len() <= 1 {
            return images.iter().enumerate().map(work).collect();
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.jobs)
            .build()
        {
            // indexed collect keeps list order
            Ok(pool) => pool.install(|| images.par_iter().enumerate().map(work).collect()),
            Err(e) => {
                warn!(error = %e, "cannot start worker pool, scanning sequentially");
                images.iter().enumerate().map(work).collect()
            }
        }
    }

    /// Process one image; never fails, errors end up in the result
    fn process_image(&self, index: usize, image: &str) -> (ImageResult, ScanStats) {
        let mut result = ImageResult::new(image);
        let mut stats = ScanStats {
            images: 1,
            ..Default::default()
        };

        // The list position keeps names apart that sanitize to the same string
        let scratch = self
            .settings
            .temp_dir
            .join(format!("{:04}-{}", index, sanitize_image_name(image)));
        let mut archive = None;

        info!(image, scratch = %scratch.display(), "processing image");
        if let Err(e) = self.scan_image(image, &scratch, &mut archive, &mut result, &mut stats) {
            warn!(image, error = %format!("{:#}", e), "image failed");
            result.error = Some(crate::error::LayerscanError::image(image, &e).to_string());
            stats.failed_images = 1;
        }

        if self.settings.cleanup {
            remove_artifacts(&scratch, archive.as_deref());
        }

        (result, stats)
    }

    fn scan_image(
        &self,
        image: &str,
        scratch: &Path,
        archive: &mut Option<PathBuf>,
        result: &mut ImageResult,
        stats: &mut ScanStats,
    ) -> Result<()> {
        if scratch.exists() {
            // Left behind by an earlier run without cleanup
            fs::remove_dir_all(scratch)
                .with_context(|| format!("cannot clear scratch directory {}", scratch.display()))?;
        }
        fs::create_dir_all(scratch)
            .with_context(|| format!("cannot create scratch directory {}", scratch.display()))?;

        let fetched = self
            .collab
            .source
            .fetch(image, scratch)
            .context("image acquisition failed")?;
        let layers = self
            .collab
            .extractor
            .extract(archive.insert(fetched).as_path(), &scratch.join("layers"))
            .context("image extraction failed")?;

        for layer in &layers {
            let scanned = self.scan_layer_once(layer)?;
            stats.layers_seen += 1;
            if scanned {
                stats.layers_scanned += 1;
            } else {
                stats.cache_hits += 1;
                debug!(image, layer = %layer.id, "layer already scanned, skipping");
            }
            result.layer_ids.push(layer.id.clone());
        }
        Ok(())
    }

    /// Scan `layer` unless it is already covered; count the reference.
    ///
    /// Returns true when this call ran the scanner. A layer whose scan fails
    /// is neither counted nor marked, so the report never lists a layer that
    /// was not actually covered.
    fn scan_layer_once(&self, layer: &ExtractedLayer) -> Result<bool> {
        {
            let mut reg = self.lock_registry();
            loop {
                match reg.claim(&layer.id) {
                    Claim::Covered => {
                        reg.touch(&layer.id);
                        return Ok(false);
                    }
                    Claim::Scan => break,
                    Claim::InFlight => {
                        reg = self
                            .scan_done
                            .wait(reg)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                }
            }
        }

        let outcome = self.run_scanner(layer);

        let mut reg = self.lock_registry();
        match outcome {
            Ok(findings) => {
                reg.finish_scan(&layer.id);
                reg.touch(&layer.id);
                drop(reg);
                self.scan_done.notify_all();
                if !findings.is_empty() {
                    warn!(layer = %layer.id, findings = findings.len(), "infections found");
                    self.infected
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(layer.id.clone(), findings);
                }
                Ok(true)
            }
            Err(e) => {
                reg.abandon_scan(&layer.id);
                drop(reg);
                self.scan_done.notify_all();
                Err(e)
            }
        }
    }

    fn run_scanner(&self, layer: &ExtractedLayer) -> Result<Vec<String>> {
        let log_path = self.settings.report_dir.join(format!("{}.log", layer.id));
        let scan_time = Utc::now();
        debug!(layer = %layer.id, log = %log_path.display(), "scanning layer");

        let findings = self.collab.scanner.scan_layer(layer, &log_path)?;
        annotate_log(
            &log_path,
            &LogAnnotation {
                layer,
                scan_time,
                fingerprint: &self.report.fingerprint,
            },
        )?;
        Ok(findings)
    }

    fn lock_registry(&self) -> MutexGuard<'_, LayerRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Delete an image's scratch directory, plus the archive when the source
/// wrote it elsewhere, logging failures
fn remove_artifacts(scratch: &Path, archive: Option<&Path>) {
    if let Some(archive) = archive.filter(|a| !a.starts_with(scratch) && a.exists()) {
        if let Err(e) = fs::remove_file(archive) {
            warn!(path = %archive.display(), error = %e, "failed to remove image archive");
        }
    }
    if scratch.exists() {
        if let Err(e) = fs::remove_dir_all(scratch) {
            warn!(path = %scratch.display(), error = %e, "failed to remove scratch directory");
        }
    }
}

/// Convenience wrapper: build an orchestrator and run it.
///
/// `report` is the empty report for this run, created when the run began.
pub fn scan_all(
    images: &[String],
    collab: Collaborators<'_>,
    settings: ScanSettings,
    report: Report,
    prior: PriorState,
    mode: OutputMode,
) -> RunOutcome {
    Orchestrator::new(collab, settings, report, prior).run(images, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::scan_cache::CacheStatus;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Each image name maps to its layer ids; "fail-*" images cannot be pulled
    struct FakeImages(HashMap<String, Vec<String>>);

    impl ImageSource for FakeImages {
        fn fetch(&self, image: &str, work_dir: &Path) -> anyhow::Result<PathBuf> {
            let layers = self
                .0
                .get(image)
                .ok_or_else(|| anyhow::anyhow!("pull access denied for {}", image))?;
            let archive = work_dir.join(format!("{}.tar", sanitize_image_name(image)));
            fs::write(&archive, layers.join("\n"))?;
            Ok(archive)
        }
    }

    struct FakeExtractor;

    impl Extractor for FakeExtractor {
        fn extract(&self, archive: &Path, dest: &Path) -> anyhow::Result<Vec<ExtractedLayer>> {
            let listing = fs::read_to_string(archive)?;
            listing
                .lines()
                .filter(|l| !l.is_empty())
                .map(|id| {
                    let path = dest.join(id);
                    fs::create_dir_all(&path)?;
                    Ok(ExtractedLayer { id: id.to_string(), path })
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct CountingScanner {
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        infected: HashSet<String>,
    }

    impl LayerScanner for CountingScanner {
        fn scan_layer(&self, layer: &ExtractedLayer, log_path: &Path) -> anyhow::Result<Vec<String>> {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().unwrap().entry(layer.id.clone()).or_insert(0) += 1;
            fs::write(log_path, "scan log\n")?;
            if self.infected.contains(&layer.id) {
                return Ok(vec![format!("{}/evil: Eicar-Signature", layer.id)]);
            }
            Ok(Vec::new())
        }
    }

    /// `("app", "L1 L2")` -> image "app" with layers L1, L2
    fn images(table: &[(&str, &str)]) -> FakeImages {
        FakeImages(
            table.iter()
                .map(|(name, layers)| {
                    (name.to_string(), layers.split_whitespace().map(str::to_string).collect())
                })
                .collect(),
        )
    }

    fn settings(dir: &TempDir, jobs: usize) -> ScanSettings {
        let report_dir = dir.path().join("reports");
        let temp_dir = dir.path().join("work");
        fs::create_dir_all(&report_dir).unwrap();
        fs::create_dir_all(&temp_dir).unwrap();
        ScanSettings {
            report_dir,
            temp_dir,
            cleanup: true,
            jobs,
        }
    }

    fn empty_prior() -> PriorState {
        PriorState {
            status: CacheStatus::NoPriorReport,
            scanned: HashSet::new(),
            infected: BTreeMap::new(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn fp() -> Fingerprint {
        Fingerprint::new("1.0", "62")
    }

    #[test]
    fn test_shared_layer_scanned_once() {
        let dir = TempDir::new().unwrap();
        let source = images(&[("a", "L1 L2"), ("b", "L2 L3")]);
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };

        let outcome = scan_all(&names(&["a", "b"]), collab, settings(&dir, 1), Report::new(fp()), empty_prior(), OutputMode::Quiet);

        assert_eq!(scanner.total.load(Ordering::SeqCst), 3);
        assert!(scanner.calls.lock().unwrap().values().all(|&n| n == 1));
        assert_eq!(outcome.registry.reference_count("L1"), 1);
        assert_eq!(outcome.registry.reference_count("L2"), 2);
        assert_eq!(outcome.registry.reference_count("L3"), 1);
        assert!(!outcome.report.images[0].unique);
        assert!(!outcome.report.images[1].unique);
        assert_eq!(outcome.stats.layers_scanned, 3);
        assert_eq!(outcome.stats.cache_hits, 1);
        assert_eq!(outcome.stats.layers_seen, 4);
    }

    #[test]
    fn test_scan_log_is_annotated() {
        let dir = TempDir::new().unwrap();
        let source = images(&[("a", "L1")]);
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };
        let settings = settings(&dir, 1);
        let report_dir = settings.report_dir.clone();

        scan_all(&names(&["a"]), collab, settings, Report::new(fp()), empty_prior(), OutputMode::Quiet);

        let log = fs::read_to_string(report_dir.join("L1.log")).unwrap();
        assert!(log.starts_with("scan log"));
        assert!(log.contains("Layer ID: L1"));
        assert!(log.contains("ClamAV Definitions: 62"));
    }

    #[test]
    fn test_failed_image_is_recorded_and_run_continues() {
        let dir = TempDir::new().unwrap();
        let source = images(&[("a", "L1"), ("c", "L3")]);
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };

        let outcome = scan_all(&names(&["a", "b", "c"]), collab, settings(&dir, 1), Report::new(fp()), empty_prior(), OutputMode::Quiet);

        let report = &outcome.report;
        assert_eq!(report.images.len(), 3);
        assert!(report.images[0].error.is_none());
        assert_eq!(report.images[0].layer_ids, vec!["L1"]);
        let error = report.images[1].error.as_deref().unwrap();
        assert!(error.contains("pull access denied"));
        assert!(report.images[1].layer_ids.is_empty());
        assert!(report.images[2].error.is_none());
        assert_eq!(report.images[2].layer_ids, vec!["L3"]);
        assert_eq!(outcome.stats.failed_images, 1);
    }

    #[test]
    fn test_cleanup_removes_artifacts() {
        let dir = TempDir::new().unwrap();
        let source = images(&[("team/app:1", "L1")]);
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };
        let settings = settings(&dir, 1);
        let temp_dir = settings.temp_dir.clone();

        scan_all(&names(&["team/app:1"]), collab, settings, Report::new(fp()), empty_prior(), OutputMode::Quiet);

        assert_eq!(fs::read_dir(&temp_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_colliding_names_get_separate_scratch_dirs() {
        let dir = TempDir::new().unwrap();
        // Both sanitize to "team.app.1"
        let source = images(&[("team/app:1", "LA"), ("team.app.1", "LB")]);
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };
        let mut settings = settings(&dir, 2);
        settings.cleanup = false;
        let temp_dir = settings.temp_dir.clone();

        let outcome = scan_all(
            &names(&["team/app:1", "team.app.1"]),
            collab,
            settings,
            Report::new(fp()),
            empty_prior(),
            OutputMode::Quiet,
        );

        assert_eq!(outcome.report.images[0].layer_ids, vec!["LA"]);
        assert_eq!(outcome.report.images[1].layer_ids, vec!["LB"]);
        let mut kept: Vec<String> = fs::read_dir(&temp_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        kept.sort();
        assert_eq!(kept, vec!["0000-team.app.1", "0001-team.app.1"]);
        assert!(temp_dir.join("0000-team.app.1/layers/LA").is_dir());
        assert!(temp_dir.join("0001-team.app.1/layers/LB").is_dir());
    }

    #[test]
    fn test_report_keeps_begin_time_of_given_report() {
        let dir = TempDir::new().unwrap();
        let source = images(&[("a", "L1")]);
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };
        let mut report = Report::new(fp());
        report.begin_time = report.begin_time - chrono::Duration::minutes(5);
        let began = report.begin_time;

        let outcome = scan_all(&names(&["a"]), collab, settings(&dir, 1), report, empty_prior(), OutputMode::Quiet);

        assert_eq!(outcome.report.begin_time, began);
        assert_eq!(outcome.report.fingerprint, fp());
        assert_eq!(outcome.report.images.len(), 1);
    }

    #[test]
    fn test_findings_are_reported_per_layer() {
        let dir = TempDir::new().unwrap();
        let source = images(&[("a", "L1 L2")]);
        let scanner = CountingScanner {
            infected: ["L2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };

        let outcome = scan_all(&names(&["a"]), collab, settings(&dir, 1), Report::new(fp()), empty_prior(), OutputMode::Quiet);

        assert_eq!(outcome.report.infected_layers.len(), 1);
        assert!(outcome.report.infected_layers["L2"][0].contains("Eicar"));
        assert_eq!(outcome.stats.infected_layers, 1);
    }

    #[test]
    fn test_parallel_run_keeps_order_and_scans_once() {
        let dir = TempDir::new().unwrap();
        let layout: Vec<(String, Vec<String>)> = (0..12)
            .map(|i| (format!("img{}", i), vec!["base".to_string(), format!("own{}", i)]))
            .collect();
        let source = FakeImages(layout.iter().cloned().collect());
        let scanner = CountingScanner::default();
        let collab = Collaborators {
            source: &source,
            extractor: &FakeExtractor,
            scanner: &scanner,
        };
        let list: Vec<String> = layout.iter().map(|(n, _)| n.clone()).collect();

        let outcome = scan_all(&list, collab, settings(&dir, 4), Report::new(fp()), empty_prior(), OutputMode::Quiet);

        let order: Vec<&str> = outcome.report.images.iter().map(|i| i.image_id.as_str()).collect();
        let expected: Vec<&str> = list.iter().map(String::as_str).collect();
        assert_eq!(order, expected);
        assert_eq!(scanner.calls.lock().unwrap()["base"], 1);
        assert_eq!(scanner.total.load(Ordering::SeqCst), 13);
        assert_eq!(outcome.registry.reference_count("base"), 12);
        assert!(outcome.report.images.iter().all(|i| !i.unique));
    }
}
