//! Persisted scan report
//!
//! One YAML document per run. The same document is read back by the next run
//! to decide which layers can be skipped, so the field names below are a
//! contract between runs.

use crate::error::{LayerscanError, Result};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome for a single image
///
/// Serialized as a single-key mapping from the image id to its body, e.g.
/// `{"nginx:1.25": {layers: [...], unique_image: true}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, ImageBody>",
    into = "BTreeMap<String, ImageBody>"
)]
pub struct ImageResult {
    pub image_id: String,
    /// Layers in extraction order
    pub layer_ids: Vec<String>,
    /// False once any layer is found in another image of the same run
    pub unique: bool,
    /// Set when acquisition, extraction or a scan failed for this image
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageBody {
    #[serde(default)]
    layers: Vec<String>,
    #[serde(default = "default_unique")]
    unique_image: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn default_unique() -> bool {
    true
}

impl ImageResult {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            layer_ids: Vec::new(),
            unique: true,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

impl TryFrom<BTreeMap<String, ImageBody>> for ImageResult {
    type Error = String;

    fn try_from(map: BTreeMap<String, ImageBody>) -> std::result::Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "expected exactly one image id per entry, found {}",
                map.len()
            ));
        }
        let (image_id, body) = map.into_iter().next().ok_or("empty image entry")?;
        Ok(Self {
            image_id,
            layer_ids: body.layers,
            unique: body.unique_image,
            error: body.error,
        })
    }
}

impl From<ImageResult> for BTreeMap<String, ImageBody> {
    fn from(result: ImageResult) -> Self {
        let body = ImageBody {
            layers: result.layer_ids,
            unique_image: result.unique,
            error: result.error,
        };
        BTreeMap::from([(result.image_id, body)])
    }
}

/// Report for a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    pub begin_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub images: Vec<ImageResult>,
    /// Findings per layer, for layers where the scanner reported infections
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub infected_layers: BTreeMap<String, Vec<String>>,
}

impl Report {
    /// Start a report; fingerprint and begin time are fixed from here on
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self::started_at(fingerprint, Utc::now())
    }

    /// Start a report for a run that began at `begin_time`
    pub fn started_at(fingerprint: Fingerprint, begin_time: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            begin_time,
            end_time: None,
            images: Vec::new(),
            infected_layers: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, result: ImageResult) {
        self.images.push(result);
    }

    /// Stamp the completion time
    pub fn finalize(&mut self) -> DateTime<Utc> {
        let end = Utc::now();
        self.end_time = Some(end);
        end
    }

    /// Every layer listed under any image, deduplicated
    pub fn all_layers(&self) -> impl Iterator<Item = &str> {
        let mut seen = std::collections::HashSet::new();
        self.images
            .iter()
            .flat_map(|image| image.layer_ids.iter())
            .filter(move |layer| seen.insert(layer.as_str()))
            .map(String::as_str)
    }

    pub fn failed_images(&self) -> usize {
        self.images.iter().filter(|i| i.is_failed()).count()
    }

    /// Deterministic file name derived from the completion time
    pub fn file_name(end: &DateTime<Utc>) -> String {
        format!("scan_results-{}.yaml", end.format("%Y%m%d-%H%M%S"))
    }

    /// Write the finalized report into `dir`
    ///
    /// Returns the path to the saved report
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let path = dir.join(Self::file_name(&end));
        let write_err = |reason: String| LayerscanError::ReportWrite {
            path: path.clone(),
            reason,
        };

        fs::create_dir_all(dir).map_err(|e| write_err(e.to_string()))?;
        let yaml = serde_yaml::to_string(self).map_err(|e| write_err(e.to_string()))?;
        fs::write(&path, yaml).map_err(|e| write_err(e.to_string()))?;

        Ok(path)
    }

    /// Load a report written by a previous run
    pub fn load(path: &Path) -> Result<Self> {
        let parse_err = |reason: String| LayerscanError::ReportParse {
            path: path.to_path_buf(),
            reason,
        };
        let content = fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Report {
        let mut report = Report::new(Fingerprint::new("0.103.8", "62"));
        let mut a = ImageResult::new("registry.local/app:1.0");
        a.layer_ids = vec!["L1".into(), "L2".into()];
        a.unique = false;
        report.push(a);
        let mut b = ImageResult::new("registry.local/broken:2.0");
        b.error = Some("docker pull failed".into());
        report.push(b);
        report
            .infected_layers
            .insert("L2".into(), vec!["/bin/x: Eicar-Signature".into()]);
        report.finalize();
        report
    }

    #[test]
    fn test_image_result_defaults() {
        let image = ImageResult::new("alpine:3.19");
        assert!(image.unique);
        assert!(image.layer_ids.is_empty());
        assert!(!image.is_failed());
    }

    #[test]
    fn test_report_yaml_shape() {
        let yaml = serde_yaml::to_string(&sample()).unwrap();
        assert!(yaml.contains("engine_version: 0.103.8"));
        assert!(yaml.contains("signature_version: '62'"));
        assert!(yaml.contains("begin_time:"));
        assert!(yaml.contains("end_time:"));
        assert!(yaml.contains("registry.local/app:1.0"));
        assert!(yaml.contains("unique_image: false"));
        assert!(yaml.contains("error: docker pull failed"));
        assert!(yaml.contains("infected_layers:"));
    }

    #[test]
    fn test_load_hand_written_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prior.yaml");
        fs::write(
            &path,
            "engine_version: 0.103.8\n\
             signature_version: '62'\n\
             begin_time: 2026-10-01T10:00:00Z\n\
             end_time: 2026-10-01T10:05:00Z\n\
             images:\n\
             - app:1.0:\n    layers:\n    - L1\n    - L2\n    unique_image: false\n\
             - db:2.0:\n    layers:\n    - L3\n    unique_image: true\n",
        )
        .unwrap();

        let report = Report::load(&path).unwrap();
        assert_eq!(report.fingerprint, Fingerprint::new("0.103.8", "62"));
        assert_eq!(report.images.len(), 2);
        assert_eq!(report.images[0].image_id, "app:1.0");
        assert_eq!(report.images[0].layer_ids, vec!["L1", "L2"]);
        assert!(!report.images[0].unique);
        assert!(report.images[1].error.is_none());
        assert!(report.infected_layers.is_empty());
        let layers: Vec<&str> = report.all_layers().collect();
        assert_eq!(layers, vec!["L1", "L2", "L3"]);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let report = sample();
        let path = report.save(dir.path()).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("scan_results-"));
        assert!(name.ends_with(".yaml"));

        let loaded = Report::load(&path).unwrap();
        assert_eq!(loaded.images, report.images);
        assert_eq!(loaded.failed_images(), 1);
        assert_eq!(loaded.infected_layers, report.infected_layers);
    }

    #[test]
    fn test_load_rejects_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "images: [not, a, report").unwrap();
        let err = Report::load(&path).unwrap_err();
        assert!(matches!(err, LayerscanError::ReportParse { .. }));
    }

    #[test]
    fn test_load_rejects_multi_key_image_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(
            &path,
            "engine_version: a\nsignature_version: b\nbegin_time: 2026-10-01T10:00:00Z\n\
             images:\n- one:\n    layers: []\n  two:\n    layers: []\n",
        )
        .unwrap();
        assert!(Report::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Report::load(Path::new("/nonexistent/report.yaml")).unwrap_err();
        assert!(matches!(err, LayerscanError::ReportParse { .. }));
        assert!(err.to_string().starts_with("failed to read report"));
    }

    #[test]
    fn test_save_into_unusable_dir_is_write_error() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("reports");
        fs::write(&not_a_dir, "occupied").unwrap();

        let err = sample().save(&not_a_dir).unwrap_err();
        assert!(matches!(err, LayerscanError::ReportWrite { .. }));
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("failed to write report"));
    }

    #[test]
    fn test_started_at_keeps_begin_time() {
        let begin = DateTime::parse_from_rfc3339("2026-10-18T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let report = Report::started_at(Fingerprint::new("1.2.1", "27000"), begin);
        assert_eq!(report.begin_time, begin);
        assert!(report.end_time.is_none());
    }

    #[test]
    fn test_file_name_is_timestamped() {
        let end = DateTime::parse_from_rfc3339("2026-10-18T09:08:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(Report::file_name(&end), "scan_results-20261018-090807.yaml");
    }
}
