#![allow(dead_code)]

use layerscan::docker::{sanitize_image_name, ImageSource};
use layerscan::extract::{ExtractedLayer, Extractor};
use layerscan::fingerprint::Fingerprint;
use layerscan::output::OutputMode;
use layerscan::report::Report;
use layerscan::scan_cache::{CacheStatus, PriorState};
use layerscan::scanner::{scan_all, Collaborators, RunOutcome, ScanSettings};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Registry stand-in: image name -> ordered layer ids.
///
/// `fetch` writes the layer list into the "archive" so the fake extractor
/// can read it back. Images in `hanging` fail the way a timed out
/// `docker pull` does.
#[derive(Default)]
pub struct FakeRegistry {
    images: HashMap<String, Vec<String>>,
    hanging: HashSet<String>,
    delay: Option<Duration>,
}

impl FakeRegistry {
    pub fn with(mut self, image: &str, layers: &[&str]) -> Self {
        self.images
            .insert(image.to_string(), layers.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn hanging(mut self, image: &str) -> Self {
        self.hanging.insert(image.to_string());
        self
    }

    /// Pause between writing the archive and returning it
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl ImageSource for FakeRegistry {
    fn fetch(&self, image: &str, work_dir: &Path) -> anyhow::Result<PathBuf> {
        if self.hanging.contains(image) {
            anyhow::bail!("\"docker\" timed out after 600s");
        }
        let layers = self
            .images
            .get(image)
            .ok_or_else(|| anyhow::anyhow!("manifest for {} not found", image))?;
        let archive = work_dir.join(format!("{}.tar", sanitize_image_name(image)));
        fs::write(&archive, layers.join("\n"))?;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Ok(archive)
    }
}

/// Creates one directory per listed layer; archives named in `corrupt` fail
#[derive(Default)]
pub struct ListExtractor {
    pub corrupt: HashSet<String>,
}

impl Extractor for ListExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> anyhow::Result<Vec<ExtractedLayer>> {
        let name = archive
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.corrupt.contains(&name) {
            anyhow::bail!("unexpected end of archive {}", archive.display());
        }
        let listing = fs::read_to_string(archive)?;
        let mut layers = Vec::new();
        for id in listing.lines().filter(|l| !l.is_empty()) {
            let path = dest.join(id);
            fs::create_dir_all(&path)?;
            fs::write(path.join("file"), id)?;
            layers.push(ExtractedLayer {
                id: id.to_string(),
                path,
            });
        }
        Ok(layers)
    }
}

/// Records every scan; layers in `infected` get one finding, layers in
/// `broken` make the scanner fail and layers in `hanging` time out
#[derive(Default)]
pub struct CountingScanner {
    pub scans: Mutex<Vec<String>>,
    pub infected: HashSet<String>,
    pub broken: HashSet<String>,
    pub hanging: HashSet<String>,
}

impl CountingScanner {
    pub fn scanned(&self) -> Vec<String> {
        self.scans.lock().unwrap().clone()
    }

    pub fn count(&self, layer: &str) -> usize {
        self.scans.lock().unwrap().iter().filter(|l| *l == layer).count()
    }
}

impl layerscan::clamav::LayerScanner for CountingScanner {
    fn scan_layer(&self, layer: &ExtractedLayer, log_path: &Path) -> anyhow::Result<Vec<String>> {
        if self.broken.contains(&layer.id) {
            anyhow::bail!("clamscan exited with status 2 on layer {}", layer.id);
        }
        if self.hanging.contains(&layer.id) {
            anyhow::bail!("\"clamscan\" timed out after 3600s");
        }
        self.scans.lock().unwrap().push(layer.id.clone());
        fs::write(log_path, format!("{}: OK\n", layer.path.display()))?;
        if self.infected.contains(&layer.id) {
            Ok(vec![format!("{}/file: Eicar-Signature", layer.path.display())])
        } else {
            Ok(Vec::new())
        }
    }
}

pub struct Workspace {
    _tmp: TempDir,
    pub report_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let report_dir = tmp.path().join("reports");
        let temp_dir = tmp.path().join("work");
        fs::create_dir_all(&report_dir).expect("create report dir");
        fs::create_dir_all(&temp_dir).expect("create temp dir");
        Self {
            _tmp: tmp,
            report_dir,
            temp_dir,
        }
    }

    pub fn settings(&self, jobs: usize) -> ScanSettings {
        ScanSettings {
            report_dir: self.report_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            cleanup: true,
            jobs,
        }
    }

    pub fn run(
        &self,
        images: &[&str],
        source: &FakeRegistry,
        extractor: &ListExtractor,
        scanner: &CountingScanner,
        prior: PriorState,
        jobs: usize,
    ) -> RunOutcome {
        let images: Vec<String> = images.iter().map(|s| s.to_string()).collect();
        let collab = Collaborators {
            source,
            extractor,
            scanner,
        };
        scan_all(
            &images,
            collab,
            self.settings(jobs),
            Report::new(fingerprint()),
            prior,
            OutputMode::Quiet,
        )
    }
}

pub fn fingerprint() -> Fingerprint {
    Fingerprint::new("1.2.1", "27000")
}

pub fn no_prior() -> PriorState {
    PriorState::empty(CacheStatus::NoPriorReport)
}
