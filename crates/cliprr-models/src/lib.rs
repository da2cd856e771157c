//! Shared domain types for the cliprr processing core.
//!
//! This crate defines the data model (jobs, fingerprints, detection results,
//! catalog records), the progress bus message contract, and the queue
//! definition table. It carries no I/O; the store, queue, and worker crates
//! build on these types.

pub mod bus;
pub mod catalog;
pub mod detection;
pub mod fingerprint;
pub mod job;
pub mod queues;

pub use bus::{BusMessage, CurrentFile, JobUpdateStatus, QueueCounts};
pub use catalog::{Episode, EpisodeFile, EpisodeFileRef, Season, Show};
pub use detection::{
    ApprovalStatus, DetectionMethod, DetectionResult, Interval, SegmentCluster,
};
pub use fingerprint::{EpisodeFingerprint, FingerprintEntry};
pub use job::{broker_job_id, truncate_notes, JobStatus, ProcessingJob, TransitionError};
pub use queues::{QueueName, QueueSpec, PAUSE_GROUP_CPU, PAUSE_GROUP_GPU};

/// Maximum length of `processing_notes` persisted on a job or detection row.
pub const MAX_NOTES_BYTES: usize = 2048;
