//! Processing job rows and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MAX_NOTES_BYTES;

/// Lifecycle status of a processing job.
///
/// Transitions are strict: `Scanning → Processing → (Detected | Failed)`,
/// `Detected → Verified` (manual sign-off or auto-approval, which may also
/// collapse `Processing → Verified`), `Verified → Completed` once trimming
/// succeeds. `Failed` and `Completed` are terminal; a failed job is only
/// retried by enqueueing a fresh job with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet picked up by a worker
    #[default]
    Scanning,
    /// A worker is extracting fingerprints
    Processing,
    /// Detection produced ranges awaiting approval
    Detected,
    /// Ranges approved (manually or automatically)
    Verified,
    /// Trimming finished
    Completed,
    /// Terminal failure
    Failed,
}

/// Error returned when a status update violates the transition DAG.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal job status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scanning => "scanning",
            JobStatus::Processing => "processing",
            JobStatus::Detected => "detected",
            JobStatus::Verified => "verified",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scanning" => Some(JobStatus::Scanning),
            "processing" => Some(JobStatus::Processing),
            "detected" => Some(JobStatus::Detected),
            "verified" => Some(JobStatus::Verified),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state (no more transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a job in this state should be re-enqueued after a restart.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, JobStatus::Scanning | JobStatus::Processing)
    }

    /// Check whether `self → to` is a legal transition.
    ///
    /// Same-state updates are legal no-ops so repeated detection runs can
    /// re-assert a status without special casing.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (JobStatus::Scanning, JobStatus::Processing)
                | (JobStatus::Scanning, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Detected)
                | (JobStatus::Processing, JobStatus::Verified)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Detected, JobStatus::Verified)
                | (JobStatus::Verified, JobStatus::Completed)
        )
    }

    /// Validate a transition, returning the typed error on violation.
    pub fn transition(&self, to: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: *self, to })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One processing job: the durable record of an episode file moving through
/// the pipeline. At most one job exists per episode file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    /// Store-assigned id
    pub id: i64,
    /// Episode file this job processes
    pub media_file_id: i64,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Detected intro range in seconds
    pub intro_start: Option<f64>,
    pub intro_end: Option<f64>,
    /// Detected credits range in seconds
    pub credits_start: Option<f64>,
    pub credits_end: Option<f64>,
    /// Detection confidence in [0, 1]
    pub confidence_score: Option<f64>,
    /// Set when a human signed off on the ranges
    pub manual_verified: bool,
    /// Free-text diagnostics, truncated to 2 KB
    pub processing_notes: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

/// Derive the stable broker id for an episode-processing job.
///
/// The broker id is a pure function of the store id, so repeated enqueues of
/// the same job collapse to one broker entry and recovery can reconcile the
/// two stores by id alone.
pub fn broker_job_id(store_job_id: i64) -> String {
    format!("epjob-{store_job_id}")
}

/// Truncate notes to the persisted maximum, respecting char boundaries.
pub fn truncate_notes(notes: &str) -> String {
    if notes.len() <= MAX_NOTES_BYTES {
        return notes.to_string();
    }
    let mut end = MAX_NOTES_BYTES;
    while !notes.is_char_boundary(end) {
        end -= 1;
    }
    notes[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_allows_forward_path() {
        assert!(JobStatus::Scanning.can_transition(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition(JobStatus::Detected));
        assert!(JobStatus::Processing.can_transition(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition(JobStatus::Verified));
        assert!(JobStatus::Detected.can_transition(JobStatus::Verified));
        assert!(JobStatus::Verified.can_transition(JobStatus::Completed));
    }

    #[test]
    fn status_dag_rejects_backwards_moves() {
        assert!(!JobStatus::Completed.can_transition(JobStatus::Scanning));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Processing));
        assert!(!JobStatus::Detected.can_transition(JobStatus::Scanning));
        assert!(!JobStatus::Verified.can_transition(JobStatus::Detected));
        assert!(!JobStatus::Scanning.can_transition(JobStatus::Detected));

        let err = JobStatus::Completed
            .transition(JobStatus::Scanning)
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(err.to, JobStatus::Scanning);
    }

    #[test]
    fn same_state_is_a_noop() {
        assert!(JobStatus::Detected.can_transition(JobStatus::Detected));
        assert!(JobStatus::Failed.can_transition(JobStatus::Failed));
    }

    #[test]
    fn broker_id_is_stable() {
        assert_eq!(broker_job_id(42), "epjob-42");
        assert_eq!(broker_job_id(42), broker_job_id(42));
    }

    #[test]
    fn notes_truncate_at_limit() {
        let long = "x".repeat(MAX_NOTES_BYTES + 100);
        assert_eq!(truncate_notes(&long).len(), MAX_NOTES_BYTES);
        assert_eq!(truncate_notes("short"), "short");
    }

    #[test]
    fn status_serde_round_trip() {
        let json = serde_json::to_string(&JobStatus::Detected).unwrap();
        assert_eq!(json, "\"detected\"");
        let back: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobStatus::Detected);
    }
}
