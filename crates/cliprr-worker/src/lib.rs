//! The cliprr processing worker.
//!
//! Pulls jobs from the six queues, runs the fingerprint extraction and
//! detection pipeline against episode files, keeps the store and the broker
//! reconciled, and executes cleanup requests.

pub mod cleanup;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod processor;
pub mod recovery;
pub mod trim;

pub use cleanup::{CleanupCoordinator, CleanupReport};
pub use config::WorkerConfig;
pub use context::WorkerContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::WorkerPool;
pub use extractor::{extract_episode, ExtractionSummary};
pub use recovery::{
    ProcessingStatusReport, RecoveryStatusReport, RecoverySupervisor,
};
