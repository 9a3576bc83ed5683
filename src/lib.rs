//! layerscan library crate
//!
//! Layer-deduplicating malware scans of container images. The binary wires
//! Docker, archive extraction and ClamAV into the orchestrator; the library
//! API lets other collaborators be plugged in.

pub mod clamav;
pub mod cli;
pub mod config;
pub mod docker;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod images;
pub mod logging;
pub mod output;
pub mod process;
pub mod progress;
pub mod report;
pub mod scan_cache;
pub mod scanner;
pub mod uniqueness;
