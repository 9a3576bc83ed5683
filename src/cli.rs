use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::clamav::ClamAv;
use crate::config::Config;
use crate::docker::DockerCli;
use crate::extract::DockerArchiveExtractor;
use crate::fingerprint::FingerprintProvider;
use crate::images::resolve_images;
use crate::output::{self, OutputMode};
use crate::progress;
use crate::report::Report;
use crate::scan_cache::{load_prior_state, BadReportPolicy};
use crate::scanner::{self, Collaborators, ScanSettings};

#[derive(Parser)]
#[command(name = "layerscan")]
#[command(version)]
#[command(about = "Scan container image layers for malware, skipping layers already covered")]
#[command(long_about = "layerscan pulls container images, unpacks their layers and runs ClamAV \
    over each layer exactly once. Layers covered by a previous report made with the same \
    scanner engine and signature versions are skipped.\n\n\
    Examples:\n  \
    layerscan scan                                   # Scan using environment settings\n  \
    layerscan scan --previous-report last.yaml       # Incremental scan\n  \
    layerscan scan --jobs 4 --json                   # Parallel, machine-readable summary\n  \
    layerscan inspect reports/scan_results-20261018-101500.yaml")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase output verbosity (-v, -vv for more)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull, unpack and scan the configured images
    #[command(visible_alias = "s")]
    Scan {
        /// TOML config file (default: config.toml in the user config directory)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Report from an earlier run; its layers are skipped if the scanner is unchanged
        #[arg(long, value_name = "FILE")]
        previous_report: Option<PathBuf>,

        /// Scan everything instead of failing when the previous report is unreadable
        #[arg(long)]
        force_full_scan_on_bad_report: bool,

        /// Number of images processed in parallel
        #[arg(short = 'j', long, value_name = "N")]
        jobs: Option<usize>,

        /// Print a JSON summary instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Print the scanner engine and signature versions
    Fingerprint {
        /// TOML config file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Summarize a saved report
    Inspect {
        /// Report file written by `layerscan scan`
        report: PathBuf,
    },
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from_flags(self.quiet, self.verbose)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let output_mode = self.output_mode();

        match self.command {
            Commands::Scan {
                config,
                previous_report,
                force_full_scan_on_bad_report,
                jobs,
                json,
            } => {
                let policy = if force_full_scan_on_bad_report {
                    BadReportPolicy::FullScan
                } else {
                    BadReportPolicy::Fail
                };
                run_scan(config, previous_report, policy, jobs, json, output_mode)
            }
            Commands::Fingerprint { config } => {
                let (settings, timeout) = Config::load_scanner_settings(config.as_deref())?;
                let fingerprint = ClamAv::new(settings, timeout).fingerprint()?;
                output::print_fingerprint(&fingerprint);
                Ok(())
            }
            Commands::Inspect { report } => {
                let loaded = Report::load(&report)?;
                output::print_report(&loaded, &report, output_mode);
                Ok(())
            }
        }
    }
}

fn run_scan(
    config_path: Option<PathBuf>,
    previous_report: Option<PathBuf>,
    policy: BadReportPolicy,
    jobs: Option<usize>,
    json: bool,
    mode: OutputMode,
) -> anyhow::Result<()> {
    let begin_time = Utc::now();
    let mut config = Config::load(config_path.as_deref())?;
    config.apply_cli_overrides(previous_report, jobs);

    let clamav = ClamAv::new(config.clamav.clone(), config.timeout);
    let fingerprint = clamav.fingerprint()?;
    info!(%fingerprint, "scanner fingerprint");

    let prior = load_prior_state(config.previous_report.as_deref(), &fingerprint, policy)?;
    let cache = prior.status.clone();

    config.prepare_dirs()?;
    let docker = DockerCli::new(config.timeout);
    docker.login(&config.registry)?;

    let spinner = (mode != OutputMode::Quiet && !json)
        .then(|| progress::create_spinner("Resolving images..."));
    let images = resolve_images(&config);
    if let Some(ref pb) = spinner {
        progress::finish_and_clear(pb);
    }
    let images = images?;
    info!(count = images.len(), jobs = config.jobs, "images to scan");

    let collab = Collaborators {
        source: &docker,
        extractor: &DockerArchiveExtractor,
        scanner: &clamav,
    };
    let settings = ScanSettings {
        report_dir: config.report_dir.clone(),
        temp_dir: config.temp_dir.clone(),
        cleanup: config.cleanup,
        jobs: config.jobs,
    };
    let bar_mode = if json { OutputMode::Quiet } else { mode };
    let outcome = scanner::scan_all(
        &images,
        collab,
        settings,
        Report::started_at(fingerprint, begin_time),
        prior,
        bar_mode,
    );

    let mut report = outcome.report;
    report.finalize();
    let path = report.save(&config.report_dir)?;
    info!(path = %path.display(), "report saved");

    if json {
        output::print_json(&report, &outcome.stats, &path)?;
    } else {
        output::print_human(&report, &outcome.stats, &cache, &path, mode);
    }
    Ok(())
}
