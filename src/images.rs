//! Resolving the list of images to scan
//!
//! Either a single configured image, or a YAML document listing image
//! references under `data.images_refs.images`. The document can live on
//! disk or in a git repository that is shallow-cloned for the run.

use crate::config::{Config, RepoSource, ScanTarget};
use crate::error::{LayerscanError, Result};
use crate::process;
use serde_yaml::Value;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

const DOMAIN_TOKEN: &str = "DOCKER_DOMAIN";
const OPEN_DOMAIN_TOKEN: &str = "DOCKER_OPEN_DOMAIN";

/// Values substituted into placeholder tokens of image references
#[derive(Debug, Clone, Default)]
pub struct Domains {
    pub docker_domain: Option<String>,
    pub docker_open_domain: Option<String>,
}

impl Domains {
    pub fn from_config(config: &Config) -> Self {
        Self {
            docker_domain: config.docker_domain.clone(),
            docker_open_domain: config.docker_open_domain.clone(),
        }
    }

    /// Replace `DOCKER_DOMAIN` / `DOCKER_OPEN_DOMAIN` in `reference`
    pub fn substitute(&self, reference: &str) -> Result<String> {
        let mut out = reference.to_string();
        for (token, value, setting) in [
            (OPEN_DOMAIN_TOKEN, &self.docker_open_domain, "docker_open_domain"),
            (DOMAIN_TOKEN, &self.docker_domain, "docker_domain"),
        ] {
            if !out.contains(token) {
                continue;
            }
            let value = value.as_deref().ok_or_else(|| {
                LayerscanError::Configuration(format!(
                    "image {} uses {} but {} is not specified",
                    reference, token, setting
                ))
            })?;
            out = out.replace(token, value);
        }
        Ok(out)
    }
}

/// Images for this run, in scan order
pub fn resolve_images(config: &Config) -> Result<Vec<String>> {
    match &config.target {
        ScanTarget::SingleImage(image) => Ok(vec![image.clone()]),
        ScanTarget::ImageList { list_file, repo } => {
            let domains = Domains::from_config(config);
            match repo {
                Some(repo) => {
                    let checkout = clone_repo(repo, config.timeout)?;
                    read_image_list(&checkout.path().join(list_file), &domains)
                }
                None => read_image_list(list_file, &domains),
            }
        }
    }
}

/// Read and parse an image list document
pub fn read_image_list(path: &Path, domains: &Domains) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| {
        LayerscanError::Configuration(format!(
            "cannot read image list {}: {}",
            path.display(),
            e
        ))
    })?;
    let images = parse_image_list(&content, domains)?;
    info!(path = %path.display(), images = images.len(), "loaded image list");
    Ok(images)
}

/// Parse `data.images_refs.images` from a YAML document, keeping document order
pub fn parse_image_list(content: &str, domains: &Domains) -> Result<Vec<String>> {
    let invalid = |reason: String| LayerscanError::Configuration(format!("invalid image list: {}", reason));

    let doc: Value = serde_yaml::from_str(content).map_err(|e| invalid(e.to_string()))?;
    let images = doc
        .get("data")
        .and_then(|d| d.get("images_refs"))
        .and_then(|r| r.get("images"))
        .and_then(Value::as_mapping)
        .ok_or_else(|| invalid("missing data.images_refs.images mapping".to_string()))?;

    images
        .iter()
        .map(|(name, reference)| {
            let reference = reference.as_str().ok_or_else(|| {
                invalid(format!("image {:?} does not map to a string reference", name))
            })?;
            domains.substitute(reference)
        })
        .collect()
}

/// Shallow-clone the repository holding the image list into a scratch dir
fn clone_repo(repo: &RepoSource, timeout: Duration) -> Result<tempfile::TempDir> {
    let checkout = tempfile::TempDir::new().map_err(|e| {
        LayerscanError::Environment(format!("cannot create checkout directory: {}", e))
    })?;
    let url = repo.clone_url();
    debug!(url = %url, branch = %repo.branch, "cloning image list repository");

    process::run(
        Command::new("git")
            .args(["clone", "--depth", "1", "--branch", repo.branch.as_str()])
            .arg(&url)
            .arg(checkout.path()),
        None,
        timeout,
    )
    .and_then(|out| out.check("git clone"))
    .map_err(|e| LayerscanError::Environment(format!("cannot clone {}: {:#}", url, e)))?;

    Ok(checkout)
}
