//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    /// A queued job references state that no longer exists (e.g. the episode
    /// file row is gone). Never retried.
    #[error("guard breach: {0}")]
    GuardBreach(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("media error: {0}")]
    Media(#[from] cliprr_media::MediaError),

    #[error("store error: {0}")]
    Store(#[from] cliprr_store::StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] cliprr_queue::QueueError),

    #[error("detection error: {0}")]
    Detect(#[from] cliprr_detect::DetectError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn processing_failed(msg: impl Into<String>) -> Self {
        Self::ProcessingFailed(msg.into())
    }

    pub fn guard_breach(msg: impl Into<String>) -> Self {
        Self::GuardBreach(msg.into())
    }

    /// Cancellation (including timeouts) gets its own terminal state and is
    /// never retried.
    pub fn is_cancellation(&self) -> bool {
        match self {
            WorkerError::Media(e) => e.is_cancellation(),
            WorkerError::Queue(cliprr_queue::QueueError::Canceled) => true,
            _ => false,
        }
    }

    /// True for failures the broker must not retry.
    pub fn is_terminal(&self) -> bool {
        self.is_cancellation() || matches!(self, WorkerError::GuardBreach(_))
    }
}
