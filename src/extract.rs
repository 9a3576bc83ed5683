//! Decomposing a saved image archive into one directory per layer
//!
//! `docker save` archives carry a `manifest.json` naming each layer tarball,
//! either as `<layer id>/layer.tar` (legacy layout) or as
//! `blobs/sha256/<digest>` (OCI layout). Each layer is unpacked into
//! `<dest>/<layer id>/` so the scanner can walk plain files.

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, warn};
use walkdir::WalkDir;

const STAGING_DIR: &str = ".archive";
const LEGACY_LAYER_FILE: &str = "layer.tar";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A layer unpacked on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLayer {
    pub id: String,
    pub path: PathBuf,
}

/// Turns an image archive into per-layer directories
pub trait Extractor: Sync {
    /// Unpack `archive` under `dest`, returning layers in archive order
    fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<ExtractedLayer>>;
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// Extractor for archives written by `docker save`
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerArchiveExtractor;

impl Extractor for DockerArchiveExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<ExtractedLayer>> {
        let staging = dest.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create {}", staging.display()))?;

        let file = File::open(archive)
            .with_context(|| format!("Failed to open archive {}", archive.display()))?;
        Archive::new(file)
            .unpack(&staging)
            .with_context(|| format!("Failed to unpack archive {}", archive.display()))?;

        let mut layers = Vec::new();
        let mut seen = HashSet::new();
        for tarball in layer_tarballs(&staging)? {
            let id = layer_id(&tarball)
                .ok_or_else(|| anyhow!("cannot derive layer id from {}", tarball.display()))?;
            if !seen.insert(id.clone()) {
                continue;
            }
            let path = dest.join(&id);
            unpack_layer(&staging.join(&tarball), &path)?;
            layers.push(ExtractedLayer { id, path });
        }

        fs::remove_dir_all(&staging)
            .with_context(|| format!("Failed to remove {}", staging.display()))?;
        debug!(archive = %archive.display(), layers = layers.len(), "archive extracted");
        Ok(layers)
    }
}

/// Layer tarball paths relative to the unpacked archive root
fn layer_tarballs(root: &Path) -> Result<Vec<PathBuf>> {
    let manifest_path = root.join("manifest.json");
    if manifest_path.exists() {
        let content = fs::read_to_string(&manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let entries: Vec<ManifestEntry> =
            serde_json::from_str(&content).context("Failed to parse manifest.json")?;
        return Ok(entries
            .into_iter()
            .flat_map(|entry| entry.layers)
            .map(PathBuf::from)
            .collect());
    }

    // No manifest: every top-level directory holding a layer.tar
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join(LEGACY_LAYER_FILE).is_file())
        .filter_map(|path| path.file_name().map(|n| PathBuf::from(n).join(LEGACY_LAYER_FILE)))
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// `abc/layer.tar` -> `abc`, `blobs/sha256/def` -> `def`
pub fn layer_id(tarball: &Path) -> Option<String> {
    let name = tarball.file_name()?.to_str()?;
    let id = if name == LEGACY_LAYER_FILE {
        tarball.parent()?.file_name()?.to_str()?
    } else {
        name.strip_suffix(".tar").unwrap_or(name)
    };
    (!id.is_empty()).then(|| id.to_string())
}

fn unpack_layer(tarball: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut file = File::open(tarball)
        .with_context(|| format!("Failed to open layer {}", tarball.display()))?;
    let mut magic = [0u8; 2];
    let gzipped = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = Archive::new(reader);
    archive.set_unpack_xattrs(false);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .with_context(|| format!("Failed to read entries of {}", tarball.display()))?;
    let mut skipped = 0usize;
    for entry in entries {
        // Truncated or corrupt layer; a partial layer is never scanned
        let mut entry =
            entry.with_context(|| format!("corrupt layer tarball {}", tarball.display()))?;
        if let Err(e) = entry.unpack_in(dest) {
            let path = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "<unknown>".to_string());
            if !is_special_file(entry.header().entry_type()) {
                return Err(e).with_context(|| {
                    format!("Failed to unpack {} from layer {}", path, tarball.display())
                });
            }
            // Device nodes and fifos need privileges and hold nothing to scan
            warn!(entry = %path, error = %e, "skipping special file");
            skipped += 1;
        }
    }
    if skipped > 0 {
        debug!(layer = %tarball.display(), skipped, "special files not unpacked");
    }
    Ok(())
}

fn is_special_file(kind: EntryType) -> bool {
    matches!(kind, EntryType::Block | EntryType::Char | EntryType::Fifo)
}

/// File count and total byte size of an extracted layer
pub fn layer_stats(path: &Path) -> (usize, u64) {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            (files + 1, bytes + size)
        })
}
