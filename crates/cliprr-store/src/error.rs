//! Store error types.

use thiserror::Error;

use cliprr_models::TransitionError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("a processing job already exists for episode file {0}")]
    DuplicateJob(i64),

    #[error("processing job {0} not found")]
    JobNotFound(i64),

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error("invalid value for setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn invalid_setting(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True when an insert collided with a UNIQUE constraint.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed")
        )
    }
}
