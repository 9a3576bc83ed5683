//! Incremental scan state
//!
//! Decides which layers can be skipped because a previous run with the same
//! scanner fingerprint already covered them, and tracks per-run layer
//! reference counts so shared layers are scanned once.

pub mod prior;
pub mod registry;
pub mod session;

pub use prior::{load_prior_state, seed_from_report, BadReportPolicy, CacheStatus, PriorState};
pub use registry::{Claim, LayerRegistry};
pub use session::ScanStats;
