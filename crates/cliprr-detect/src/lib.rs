//! Cross-episode intro/credits detection.
//!
//! The clustering core is pure: given fingerprint rows and options it always
//! produces the same labeled segments, bit for bit. The runner wraps it with
//! store I/O: season loading with cross-season fallback, the preservation
//! policy, approval, and per-episode writes.

pub mod clustering;
pub mod runner;

use thiserror::Error;

pub use clustering::{cluster_season, DetectorOptions, SeasonClusters};
pub use runner::{DetectionOutcome, SeasonDetector};

pub type DetectResult<T> = Result<T, DetectError>;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("store error: {0}")]
    Store(#[from] cliprr_store::StoreError),
}
