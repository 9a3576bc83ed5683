use crate::fingerprint::Fingerprint;
use crate::report::Report;
use crate::scan_cache::{CacheStatus, ScanStats};
use colored::*;
use serde::Serialize;
use std::path::Path;

/// Output verbosity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Quiet,       // Only errors
    Normal,      // Standard output
    Verbose,     // Layer ids per image
    VeryVerbose, // Layer ids and full findings
}

impl OutputMode {
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        if quiet {
            OutputMode::Quiet
        } else if verbose >= 2 {
            OutputMode::VeryVerbose
        } else if verbose == 1 {
            OutputMode::Verbose
        } else {
            OutputMode::Normal
        }
    }

    fn shows_layers(self) -> bool {
        matches!(self, OutputMode::Verbose | OutputMode::VeryVerbose)
    }
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    version: &'static str,
    report_path: String,
    scan_type: &'static str,
    engine_version: &'a str,
    signature_version: &'a str,
    stats: &'a ScanStats,
    images: Vec<JsonImage<'a>>,
    infected_layers: Vec<&'a str>,
}

#[derive(Serialize)]
struct JsonImage<'a> {
    image: &'a str,
    layers: usize,
    unique: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// One-line description of how the previous report was used
pub fn describe_cache(status: &CacheStatus) -> String {
    match status {
        CacheStatus::NoPriorReport => "no previous report, full scan".to_string(),
        CacheStatus::Unreadable { reason } => {
            format!("previous report unreadable ({}), full scan", reason)
        }
        CacheStatus::Stale { previous } => {
            format!("scanner changed since {}, full scan", previous)
        }
        CacheStatus::Trusted { layers } => {
            format!("{} layers trusted from previous report", layers)
        }
    }
}

pub fn print_fingerprint(fingerprint: &Fingerprint) {
    println!("{} {}", "ClamAV engine:    ".bold(), fingerprint.engine_version.cyan());
    println!("{} {}", "Signature version:".bold(), fingerprint.signature_version.cyan());
}

pub fn print_human(
    report: &Report,
    stats: &ScanStats,
    cache: &CacheStatus,
    report_path: &Path,
    mode: OutputMode,
) {
    if mode == OutputMode::Quiet {
        return;
    }

    println!();
    println!("{}", "Layer Scan Results".bold().underline());
    println!("{}", "=".repeat(60).dimmed());
    println!("Scanner:  {}", report.fingerprint.to_string().cyan());
    println!("Cache:    {}", describe_cache(cache).dimmed());
    println!();

    print_images(report, mode);

    println!("{}", "-".repeat(60).dimmed());
    println!(
        "{} images ({} failed), {} layers scanned, {} skipped [{}]",
        stats.images.to_string().bold(),
        if stats.failed_images > 0 {
            stats.failed_images.to_string().red().bold()
        } else {
            stats.failed_images.to_string().normal()
        },
        stats.layers_scanned.to_string().bold(),
        stats.cache_hits.to_string().bold(),
        stats.scan_type()
    );

    print_infections(report, mode);

    println!();
    println!("Report written to {}", report_path.display().to_string().green());
    println!();
}

fn print_images(report: &Report, mode: OutputMode) {
    println!(
        "{:<50} {:>7} {:>10}",
        "Image".bold(),
        "Layers".bold(),
        "Status".bold()
    );
    println!("{}", "-".repeat(60).dimmed());

    for image in &report.images {
        let status = match (&image.error, image.unique) {
            (Some(_), _) => "[ERROR]".red().bold(),
            (None, true) => "unique".green(),
            (None, false) => "shared".yellow(),
        };
        println!(
            "{:<50} {:>7} {:>10}",
            image.image_id,
            image.layer_ids.len(),
            status
        );
        if let Some(ref err) = image.error {
            println!("  {}", err.red());
        }
        if mode.shows_layers() {
            for layer in &image.layer_ids {
                let marker = if report.infected_layers.contains_key(layer) {
                    " [INFECTED]".red().bold()
                } else {
                    "".normal()
                };
                println!("  {}{}", layer.dimmed(), marker);
            }
        }
    }
}

fn print_infections(report: &Report, mode: OutputMode) {
    if report.infected_layers.is_empty() {
        println!("{}", "No infections found.".green());
        return;
    }

    println!(
        "{} {} infected layer(s)",
        "Warning:".yellow().bold(),
        report.infected_layers.len()
    );
    for (layer, findings) in &report.infected_layers {
        println!("  {} ({} finding(s))", layer.red(), findings.len());
        if mode == OutputMode::VeryVerbose {
            for finding in findings {
                println!("    {}", finding.dimmed());
            }
        }
    }
}

pub fn print_json(
    report: &Report,
    stats: &ScanStats,
    report_path: &Path,
) -> anyhow::Result<()> {
    let summary = JsonSummary {
        version: env!("CARGO_PKG_VERSION"),
        report_path: report_path.display().to_string(),
        scan_type: stats.scan_type(),
        engine_version: &report.fingerprint.engine_version,
        signature_version: &report.fingerprint.signature_version,
        stats,
        images: report
            .images
            .iter()
            .map(|image| JsonImage {
                image: &image.image_id,
                layers: image.layer_ids.len(),
                unique: image.unique,
                error: image.error.as_deref(),
            })
            .collect(),
        infected_layers: report.infected_layers.keys().map(String::as_str).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Summary of a saved report
pub fn print_report(report: &Report, path: &Path, mode: OutputMode) {
    println!();
    println!("{} {}", "Report".bold(), path.display());
    println!("Scanner:  {}", report.fingerprint.to_string().cyan());
    let end = report
        .end_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unfinished".to_string());
    println!("Run:      {} .. {}", report.begin_time.to_rfc3339(), end);
    println!(
        "Layers:   {} distinct across {} images ({} failed)",
        report.all_layers().count(),
        report.images.len(),
        report.failed_images()
    );
    println!();

    print_images(report, mode);
    println!();
    print_infections(report, mode);
    println!();
}
