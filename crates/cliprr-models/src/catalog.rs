//! Catalog records: shows, seasons, episodes, and their files.
//!
//! The catalog is owned by the external importer; the processing core only
//! reads these rows (and deletes them on show cleanup, via FK cascade).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Show {
    pub id: i64,
    pub title: String,
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub id: i64,
    pub show_id: i64,
    pub season_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub season_id: i64,
    pub show_id: i64,
    pub season_number: i64,
    pub episode_number: i64,
    pub title: String,
}

/// The unit all processing references: one media file of one episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeFile {
    pub id: i64,
    pub episode_id: i64,
    /// Absolute path on disk
    pub path: String,
    /// Size in bytes
    pub size: i64,
}

/// Episode file joined with its catalog coordinates, as the extractor and
/// detector consume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeFileRef {
    pub file: EpisodeFile,
    pub show_id: i64,
    pub show_title: String,
    pub season_number: i64,
    pub episode_number: i64,
}
