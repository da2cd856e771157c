//! Episode fingerprint rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One fingerprinted audio window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    /// Window start offset from the beginning of the file, in seconds
    pub offset_seconds: f64,
    /// Opaque acoustic hash produced by the fingerprint tool; compared by
    /// equality only
    pub fingerprint: String,
}

/// The fingerprint stream of one episode file.
///
/// Unique per `(show_id, season_number, episode_number, episode_file_id)`.
/// Rescans invalidate the row instead of deleting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeFingerprint {
    pub show_id: i64,
    pub season_number: i64,
    pub episode_number: i64,
    pub episode_file_id: i64,
    /// Ordered list of fingerprinted windows
    pub fingerprint_data: Vec<FingerprintEntry>,
    /// Probed media duration in seconds
    pub file_duration: f64,
    /// File size in bytes
    pub file_size: i64,
    pub is_valid: bool,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

impl EpisodeFingerprint {
    pub fn new(
        show_id: i64,
        season_number: i64,
        episode_number: i64,
        episode_file_id: i64,
        fingerprint_data: Vec<FingerprintEntry>,
        file_duration: f64,
        file_size: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            show_id,
            season_number,
            episode_number,
            episode_file_id,
            fingerprint_data,
            file_duration,
            file_size,
            is_valid: true,
            created_date: now,
            updated_date: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serde_round_trip() {
        let entry = FingerprintEntry {
            offset_seconds: 30.0,
            fingerprint: "AQAAf0mSJEuS".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: FingerprintEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
