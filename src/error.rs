//! Error types for layerscan.
//!
//! Run-level failures are typed so the binary can map each kind to its own
//! exit status. Failures of a single image never surface here as a process
//! error; they are recorded against the image in the report.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for layerscan operations.
pub type Result<T> = std::result::Result<T, LayerscanError>;

#[derive(Error, Debug)]
pub enum LayerscanError {
    /// A required setting is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external tool is unreachable or produced output we cannot parse.
    #[error("environment error: {0}")]
    Environment(String),

    /// A saved report could not be read or parsed.
    #[error("failed to read report {path:?}: {reason}")]
    ReportParse { path: PathBuf, reason: String },

    /// Acquiring, extracting or scanning one image failed.
    #[error("failed to process image {image}: {reason}")]
    ImageProcessing { image: String, reason: String },

    /// The final report could not be written.
    #[error("failed to write report to {path:?}: {reason}")]
    ReportWrite { path: PathBuf, reason: String },
}

impl LayerscanError {
    /// Process exit status for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            LayerscanError::Configuration(_) => 2,
            LayerscanError::Environment(_) => 3,
            LayerscanError::ReportParse { .. } => 4,
            LayerscanError::ReportWrite { .. } => 5,
            LayerscanError::ImageProcessing { .. } => 1,
        }
    }

    pub(crate) fn image(image: &str, err: &anyhow::Error) -> Self {
        LayerscanError::ImageProcessing {
            image: image.to_string(),
            reason: format!("{:#}", err),
        }
    }
}
