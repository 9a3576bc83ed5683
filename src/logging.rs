//! Diagnostic logging setup.
//!
//! Events go to stderr so stdout stays clean for `--json`. `RUST_LOG` wins
//! over the command-line verbosity when it is set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for the given verbosity flags
pub fn default_directive(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        "layerscan=error"
    } else {
        match verbose {
            0 => "layerscan=info",
            1 => "layerscan=debug",
            _ => "layerscan=trace",
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(quiet: bool, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(quiet, verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false, 0), "layerscan=info");
        assert_eq!(default_directive(false, 1), "layerscan=debug");
        assert_eq!(default_directive(false, 5), "layerscan=trace");
        assert_eq!(default_directive(true, 2), "layerscan=error");
    }
}
