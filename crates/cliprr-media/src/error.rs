//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while driving the external tools.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolNotFound(&'static str),

    #[error("{tool} failed: {message}")]
    ToolFailed {
        tool: String,
        message: String,
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("ffprobe failed: {message}")]
    ProbeFailed {
        message: String,
        stderr_tail: Option<String>,
    },

    #[error("no usable output produced: {0}")]
    EmptyOutput(PathBuf),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("operation canceled")]
    Canceled,

    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create a tool failure error.
    pub fn tool_failed(
        tool: impl Into<String>,
        message: impl Into<String>,
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
            stderr_tail,
            exit_code,
        }
    }

    /// Cancellation and timeout are equivalent for retry purposes: neither
    /// is retried by the broker.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MediaError::Canceled | MediaError::Timeout(_))
    }
}
