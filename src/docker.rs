//! Image acquisition through the docker CLI

use crate::config::RegistryAuth;
use crate::error::{LayerscanError, Result};
use crate::process;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Produces a local archive for a named image
pub trait ImageSource: Sync {
    /// Write `image` as a tar archive under `work_dir` and return its path
    fn fetch(&self, image: &str, work_dir: &Path) -> anyhow::Result<PathBuf>;
}

/// File-system safe name for an image reference
///
/// `registry:5000/team/app@sha256:ab` -> `registry.5000.team.app.sha256.ab`
pub fn sanitize_image_name(image: &str) -> String {
    image.replace(['/', ':', '@'], ".")
}

/// `docker pull` + `docker save` against the configured registry
pub struct DockerCli {
    binary: PathBuf,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: PathBuf::from("docker"),
            timeout,
        }
    }

    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Log in once for the whole run; the password goes through stdin
    pub fn login(&self, auth: &RegistryAuth) -> Result<()> {
        info!(server = %auth.server, user = %auth.username, "logging in to registry");
        process::run(
            Command::new(&self.binary).args([
                "login",
                "--username",
                auth.username.as_str(),
                "--password-stdin",
                auth.server.as_str(),
            ]),
            Some(&auth.password),
            self.timeout,
        )
        .and_then(|out| out.check("docker login"))
        .map(|_| ())
        .map_err(|e| {
            LayerscanError::Environment(format!("docker login to {} failed: {:#}", auth.server, e))
        })
    }
}

impl ImageSource for DockerCli {
    fn fetch(&self, image: &str, work_dir: &Path) -> anyhow::Result<PathBuf> {
        let archive = work_dir.join(format!("{}.tar", sanitize_image_name(image)));

        debug!(image, "pulling image");
        process::run(Command::new(&self.binary).args(["pull", image]), None, self.timeout)?
            .check("docker pull")
            .with_context(|| format!("Failed to pull {}", image))?;

        debug!(image, archive = %archive.display(), "saving image");
        process::run(
            Command::new(&self.binary)
                .arg("save")
                .arg("-o")
                .arg(&archive)
                .arg(image),
            None,
            self.timeout,
        )?
        .check("docker save")
        .with_context(|| format!("Failed to save {}", image))?;

        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_image_name() {
        assert_eq!(
            sanitize_image_name("registry:5000/team/app:1.0"),
            "registry.5000.team.app.1.0"
        );
        assert_eq!(sanitize_image_name("app@sha256:ab12"), "app.sha256.ab12");
        assert_eq!(sanitize_image_name("alpine"), "alpine");
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_binary_fails_fetch() {
        let dir = tempfile::TempDir::new().unwrap();
        let docker = DockerCli::with_binary(
            PathBuf::from("/nonexistent/docker"),
            Duration::from_secs(5),
        );
        assert!(docker.fetch("alpine:3.19", dir.path()).is_err());
    }
}
