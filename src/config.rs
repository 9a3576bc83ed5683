//! Run configuration
//!
//! Settings come from an optional TOML file, then `LAYERSCAN_*` environment
//! variables, then command-line overrides. Everything is validated once at
//! startup; a missing required setting stops the run before any image is
//! touched.

use crate::error::{LayerscanError, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "LAYERSCAN_";
const DEFAULT_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_BRANCH: &str = "master";

/// Registry login used for `docker login`
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Version-control remote holding the image list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSource {
    /// `host:port/path.git`, cloned as `ssh://<user>@<repo>`
    pub repo: String,
    pub user: String,
    pub branch: String,
}

impl RepoSource {
    pub fn clone_url(&self) -> String {
        format!("ssh://{}@{}", self.user, self.repo)
    }
}

/// Which images a run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    SingleImage(String),
    /// `list_file` is relative to the clone root when `repo` is set
    ImageList {
        list_file: PathBuf,
        repo: Option<RepoSource>,
    },
}

/// Locations of the ClamAV tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClamAvSettings {
    pub clamscan: PathBuf,
    pub sigtool: PathBuf,
    pub signature_db: PathBuf,
}

impl Default for ClamAvSettings {
    fn default() -> Self {
        Self {
            clamscan: PathBuf::from("clamscan"),
            sigtool: PathBuf::from("sigtool"),
            signature_db: PathBuf::from("/var/lib/clamav/main.cvd"),
        }
    }
}

/// Validated settings for one run
#[derive(Debug, Clone)]
pub struct Config {
    pub registry: RegistryAuth,
    pub report_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Remove archives and extracted layers after each image
    pub cleanup: bool,
    pub target: ScanTarget,
    pub previous_report: Option<PathBuf>,
    pub docker_domain: Option<String>,
    pub docker_open_domain: Option<String>,
    pub clamav: ClamAvSettings,
    /// Deadline for each external command
    pub timeout: Duration,
    /// Images processed in parallel
    pub jobs: usize,
}

/// On-disk form of the settings, every key optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub docker_server: Option<String>,
    pub docker_username: Option<String>,
    pub docker_password: Option<String>,
    pub report_dir: Option<String>,
    pub temp_dir: Option<String>,
    pub cleanup: Option<bool>,
    pub scan_type: Option<String>,
    pub image: Option<String>,
    pub list_file: Option<String>,
    pub repo: Option<String>,
    pub repo_user: Option<String>,
    pub repo_branch: Option<String>,
    pub previous_report: Option<String>,
    pub docker_domain: Option<String>,
    pub docker_open_domain: Option<String>,
    pub clamscan: Option<String>,
    pub sigtool: Option<String>,
    pub signature_db: Option<String>,
    pub timeout_secs: Option<u64>,
    pub jobs: Option<usize>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            LayerscanError::Configuration(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            LayerscanError::Configuration(format!(
                "invalid config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// The explicit file, else the default location if it exists, else empty
    pub fn locate(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => Self::read(path),
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::read(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Look up a setting by its key, as a string
    fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "docker_server" => self.docker_server.clone(),
            "docker_username" => self.docker_username.clone(),
            "docker_password" => self.docker_password.clone(),
            "report_dir" => self.report_dir.clone(),
            "temp_dir" => self.temp_dir.clone(),
            "cleanup" => self.cleanup.map(|b| b.to_string()),
            "scan_type" => self.scan_type.clone(),
            "image" => self.image.clone(),
            "list_file" => self.list_file.clone(),
            "repo" => self.repo.clone(),
            "repo_user" => self.repo_user.clone(),
            "repo_branch" => self.repo_branch.clone(),
            "previous_report" => self.previous_report.clone(),
            "docker_domain" => self.docker_domain.clone(),
            "docker_open_domain" => self.docker_open_domain.clone(),
            "clamscan" => self.clamscan.clone(),
            "sigtool" => self.sigtool.clone(),
            "signature_db" => self.signature_db.clone(),
            "timeout_secs" => self.timeout_secs.map(|n| n.to_string()),
            "jobs" => self.jobs.map(|n| n.to_string()),
            _ => None,
        };
        value.filter(|v| !v.is_empty())
    }
}

/// Environment variable name for a setting key
pub fn env_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.to_uppercase())
}

/// Default config file location (`<config dir>/layerscan/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "layerscan").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Collects lookups and remembers every problem, so one error names them all
struct Resolver<'a, F: Fn(&str) -> Option<String>> {
    file: &'a ConfigFile,
    env: F,
    problems: Vec<String>,
}

impl<'a, F: Fn(&str) -> Option<String>> Resolver<'a, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.env)(&env_name(key))
            .filter(|v| !v.is_empty())
            .or_else(|| self.file.get(key))
    }

    fn required(&mut self, key: &str, what: &str) -> String {
        match self.optional(key) {
            Some(v) => v,
            None => {
                self.problems
                    .push(format!("{} is not specified (set {})", what, env_name(key)));
                String::new()
            }
        }
    }

    fn scanner(&mut self) -> (ClamAvSettings, Duration) {
        let defaults = ClamAvSettings::default();
        let clamav = ClamAvSettings {
            clamscan: self.optional("clamscan").map(PathBuf::from).unwrap_or(defaults.clamscan),
            sigtool: self.optional("sigtool").map(PathBuf::from).unwrap_or(defaults.sigtool),
            signature_db: self
                .optional("signature_db")
                .map(PathBuf::from)
                .unwrap_or(defaults.signature_db),
        };
        let timeout_secs: u64 = self.parsed("timeout_secs", DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            self.problems.push(format!("{} must be positive", env_name("timeout_secs")));
        }
        (clamav, Duration::from_secs(timeout_secs))
    }

    fn parsed<T: std::str::FromStr>(&mut self, key: &str, default: T) -> T {
        match self.optional(key) {
            None => default,
            Some(raw) => match raw.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    self.problems
                        .push(format!("{} has invalid value {:?}", env_name(key), raw));
                    default
                }
            },
        }
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load from the config file (explicit or default location) and the
    /// process environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = ConfigFile::locate(config_path)?;
        Self::from_sources(&file, |name| std::env::var(name).ok())
    }

    /// Build and validate from a file layer and an environment lookup
    pub fn from_sources<F>(file: &ConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut r = Resolver {
            file,
            env,
            problems: Vec::new(),
        };

        let registry = RegistryAuth {
            server: r.required("docker_server", "Docker server"),
            username: r.required("docker_username", "Docker username"),
            password: r.required("docker_password", "Docker password"),
        };
        let report_dir = PathBuf::from(r.required("report_dir", "Report directory"));
        let temp_dir = PathBuf::from(r.required("temp_dir", "Temporary directory"));

        let cleanup_raw = r.required("cleanup", "Cleanup mode");
        let cleanup = if cleanup_raw.is_empty() {
            false
        } else {
            parse_bool(&cleanup_raw).unwrap_or_else(|| {
                r.problems.push(format!(
                    "{} must be true or false, got {:?}",
                    env_name("cleanup"),
                    cleanup_raw
                ));
                false
            })
        };

        let target = match r.optional("scan_type").as_deref() {
            Some("single-image") | Some("singleImage") => {
                ScanTarget::SingleImage(r.required("image", "scan_type is single-image but image"))
            }
            Some("image-list") | Some("imageList") => {
                let list_file =
                    PathBuf::from(r.required("list_file", "scan_type is image-list but list_file"));
                let repo = match r.optional("repo") {
                    Some(repo) => Some(RepoSource {
                        repo,
                        user: r.required("repo_user", "repo is set but repo_user"),
                        branch: r
                            .optional("repo_branch")
                            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
                    }),
                    None => None,
                };
                ScanTarget::ImageList { list_file, repo }
            }
            other => {
                r.problems.push(format!(
                    "a valid scan type is not specified (set {} to single-image or image-list, got {:?})",
                    env_name("scan_type"),
                    other.unwrap_or("")
                ));
                ScanTarget::SingleImage(String::new())
            }
        };

        let (clamav, timeout) = r.scanner();
        let jobs: usize = r.parsed("jobs", 1);
        if jobs == 0 {
            r.problems.push(format!("{} must be at least 1", env_name("jobs")));
        }

        let previous_report = r.optional("previous_report").map(PathBuf::from);
        let docker_domain = r.optional("docker_domain");
        let docker_open_domain = r.optional("docker_open_domain");

        if !r.problems.is_empty() {
            return Err(LayerscanError::Configuration(r.problems.join("; ")));
        }

        Ok(Self {
            registry,
            report_dir,
            temp_dir,
            cleanup,
            target,
            previous_report,
            docker_domain,
            docker_open_domain,
            clamav,
            timeout,
            jobs,
        })
    }

    /// Only the scanner tool settings, for commands that never touch a registry
    pub fn load_scanner_settings(config_path: Option<&Path>) -> Result<(ClamAvSettings, Duration)> {
        let file = ConfigFile::locate(config_path)?;
        let mut r = Resolver {
            file: &file,
            env: |name: &str| std::env::var(name).ok(),
            problems: Vec::new(),
        };
        let settings = r.scanner();
        if !r.problems.is_empty() {
            return Err(LayerscanError::Configuration(r.problems.join("; ")));
        }
        Ok(settings)
    }

    /// Apply command-line overrides on top of file and environment values
    pub fn apply_cli_overrides(&mut self, previous_report: Option<PathBuf>, jobs: Option<usize>) {
        if let Some(path) = previous_report {
            self.previous_report = Some(path);
        }
        if let Some(jobs) = jobs {
            self.jobs = jobs.max(1);
        }
    }

    /// Create the report and temp directories
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [&self.report_dir, &self.temp_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                LayerscanError::Configuration(format!(
                    "cannot create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
