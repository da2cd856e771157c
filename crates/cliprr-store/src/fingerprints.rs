//! Fingerprint and detection-result persistence.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use cliprr_models::{
    ApprovalStatus, DetectionMethod, DetectionResult, EpisodeFingerprint, FingerprintEntry,
    Interval, SegmentCluster,
};

use crate::error::{StoreError, StoreResult};

/// Store for fingerprint streams and detection results.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    pool: SqlitePool,
}

impl FingerprintStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert one episode's fingerprint stream on its unique tuple.
    pub async fn put_fingerprints(&self, row: &EpisodeFingerprint) -> StoreResult<()> {
        let data = serde_json::to_string(&row.fingerprint_data)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO episode_fingerprints
                (show_id, season_number, episode_number, episode_file_id,
                 fingerprint_data, file_duration, file_size, is_valid,
                 created_date, updated_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.show_id)
        .bind(row.season_number)
        .bind(row.episode_number)
        .bind(row.episode_file_id)
        .bind(data)
        .bind(row.file_duration)
        .bind(row.file_size)
        .bind(row.is_valid)
        .bind(row.created_date)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(
            show_id = row.show_id,
            season = row.season_number,
            episode = row.episode_number,
            windows = row.fingerprint_data.len(),
            "stored episode fingerprints"
        );
        Ok(())
    }

    /// All fingerprint rows of one season, skipping invalidated rows unless
    /// asked otherwise.
    pub async fn season_fingerprints(
        &self,
        show_id: i64,
        season_number: i64,
        include_invalid: bool,
    ) -> StoreResult<Vec<EpisodeFingerprint>> {
        let sql = if include_invalid {
            r#"
            SELECT * FROM episode_fingerprints
            WHERE show_id = ? AND season_number = ?
            ORDER BY episode_number, episode_file_id
            "#
        } else {
            r#"
            SELECT * FROM episode_fingerprints
            WHERE show_id = ? AND season_number = ? AND is_valid = 1
            ORDER BY episode_number, episode_file_id
            "#
        };
        let rows = sqlx::query(sql)
            .bind(show_id)
            .bind(season_number)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_fingerprint).collect()
    }

    /// Fingerprints of seasons before `up_to_season`, grouped by season,
    /// most recent season first, truncated to `limit_seasons` seasons.
    pub async fn previous_season_fingerprints(
        &self,
        show_id: i64,
        up_to_season: i64,
        limit_seasons: usize,
    ) -> StoreResult<Vec<(i64, Vec<EpisodeFingerprint>)>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM episode_fingerprints
            WHERE show_id = ? AND season_number < ? AND is_valid = 1
            ORDER BY season_number DESC, episode_number, episode_file_id
            "#,
        )
        .bind(show_id)
        .bind(up_to_season)
        .fetch_all(&self.pool)
        .await?;

        let mut seasons: Vec<(i64, Vec<EpisodeFingerprint>)> = Vec::new();
        for row in rows {
            let fp = row_to_fingerprint(row)?;
            let same_season = seasons
                .last()
                .is_some_and(|(season, _)| *season == fp.season_number);
            if same_season {
                if let Some((_, list)) = seasons.last_mut() {
                    list.push(fp);
                }
            } else {
                if seasons.len() >= limit_seasons {
                    break;
                }
                seasons.push((fp.season_number, vec![fp]));
            }
        }
        Ok(seasons)
    }

    /// Mark fingerprints invalid (a rescan replaces them; history is kept).
    pub async fn invalidate(&self, show_id: i64, season_number: Option<i64>) -> StoreResult<u64> {
        let affected = match season_number {
            Some(season) => {
                sqlx::query(
                    "UPDATE episode_fingerprints SET is_valid = 0, updated_date = ? WHERE show_id = ? AND season_number = ?",
                )
                .bind(Utc::now())
                .bind(show_id)
                .bind(season)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE episode_fingerprints SET is_valid = 0, updated_date = ? WHERE show_id = ?",
                )
                .bind(Utc::now())
                .bind(show_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(affected.rows_affected())
    }

    /// Remove fingerprints and detection results for one episode file.
    pub async fn delete_by_episode_file(&self, episode_file_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM episode_fingerprints WHERE episode_file_id = ?")
            .bind(episode_file_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM detection_results WHERE episode_file_id = ?")
            .bind(episode_file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upsert one detection result on its unique tuple.
    pub async fn put_detection_result(&self, row: &DetectionResult) -> StoreResult<()> {
        let stingers = serde_json::to_string(&row.stingers)?;
        let segments = serde_json::to_string(&row.segments)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO detection_results
                (show_id, season_number, episode_number, episode_file_id,
                 intro_start, intro_end, credits_start, credits_end,
                 stingers_data, segments_data, confidence_score,
                 detection_method, approval_status, processing_notes,
                 created_date, updated_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.show_id)
        .bind(row.season_number)
        .bind(row.episode_number)
        .bind(row.episode_file_id)
        .bind(row.intro.map(|i| i.start))
        .bind(row.intro.map(|i| i.end))
        .bind(row.credits.map(|c| c.start))
        .bind(row.credits.map(|c| c.end))
        .bind(stingers)
        .bind(segments)
        .bind(row.confidence_score)
        .bind(row.detection_method.as_str())
        .bind(row.approval_status.as_str())
        .bind(&row.processing_notes)
        .bind(row.created_date)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The strongest stored result for a season (confidence descending).
    pub async fn latest_detection_result(
        &self,
        show_id: i64,
        season_number: i64,
    ) -> StoreResult<Option<DetectionResult>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM detection_results
            WHERE show_id = ? AND season_number = ?
            ORDER BY confidence_score DESC, episode_number ASC
            LIMIT 1
            "#,
        )
        .bind(show_id)
        .bind(season_number)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_detection).transpose()
    }

    pub async fn season_detection_results(
        &self,
        show_id: i64,
        season_number: i64,
    ) -> StoreResult<Vec<DetectionResult>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM detection_results
            WHERE show_id = ? AND season_number = ?
            ORDER BY episode_number, episode_file_id
            "#,
        )
        .bind(show_id)
        .bind(season_number)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_detection).collect()
    }
}

fn row_to_fingerprint(row: sqlx::sqlite::SqliteRow) -> StoreResult<EpisodeFingerprint> {
    let data: String = row.try_get("fingerprint_data")?;
    let fingerprint_data: Vec<FingerprintEntry> = serde_json::from_str(&data)?;
    Ok(EpisodeFingerprint {
        show_id: row.try_get("show_id")?,
        season_number: row.try_get("season_number")?,
        episode_number: row.try_get("episode_number")?,
        episode_file_id: row.try_get("episode_file_id")?,
        fingerprint_data,
        file_duration: row.try_get("file_duration")?,
        file_size: row.try_get("file_size")?,
        is_valid: row.try_get("is_valid")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

fn row_to_detection(row: sqlx::sqlite::SqliteRow) -> StoreResult<DetectionResult> {
    let stingers: String = row.try_get("stingers_data")?;
    let segments: String = row.try_get("segments_data")?;
    let method: String = row.try_get("detection_method")?;
    let approval: String = row.try_get("approval_status")?;

    let intro = match (
        row.try_get::<Option<f64>, _>("intro_start")?,
        row.try_get::<Option<f64>, _>("intro_end")?,
    ) {
        (Some(s), Some(e)) => Some(Interval::new(s, e)),
        _ => None,
    };
    let credits = match (
        row.try_get::<Option<f64>, _>("credits_start")?,
        row.try_get::<Option<f64>, _>("credits_end")?,
    ) {
        (Some(s), Some(e)) => Some(Interval::new(s, e)),
        _ => None,
    };

    Ok(DetectionResult {
        show_id: row.try_get("show_id")?,
        season_number: row.try_get("season_number")?,
        episode_number: row.try_get("episode_number")?,
        episode_file_id: row.try_get("episode_file_id")?,
        intro,
        credits,
        stingers: serde_json::from_str::<Vec<Interval>>(&stingers)?,
        segments: serde_json::from_str::<Vec<SegmentCluster>>(&segments)?,
        confidence_score: row.try_get("confidence_score")?,
        detection_method: DetectionMethod::parse(&method).ok_or_else(|| {
            StoreError::InvalidRange(format!("unknown detection method in store: {method}"))
        })?,
        approval_status: ApprovalStatus::parse(&approval).ok_or_else(|| {
            StoreError::InvalidRange(format!("unknown approval status in store: {approval}"))
        })?,
        processing_notes: row.try_get("processing_notes")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn sample_fingerprint(episode: i64, file_id: i64) -> EpisodeFingerprint {
        EpisodeFingerprint::new(
            1,
            1,
            episode,
            file_id,
            vec![
                FingerprintEntry {
                    offset_seconds: 0.0,
                    fingerprint: format!("fp-{episode}-a"),
                },
                FingerprintEntry {
                    offset_seconds: 10.0,
                    fingerprint: "fp-common".to_string(),
                },
            ],
            1800.0,
            700_000_000,
        )
    }

    fn sample_result(episode: i64, file_id: i64, confidence: f64) -> DetectionResult {
        let now = Utc::now();
        DetectionResult {
            show_id: 1,
            season_number: 1,
            episode_number: episode,
            episode_file_id: file_id,
            intro: Some(Interval::new(0.0, 50.0)),
            credits: None,
            stingers: vec![],
            segments: vec![],
            confidence_score: confidence,
            detection_method: DetectionMethod::CurrentSeason,
            approval_status: ApprovalStatus::Pending,
            processing_notes: None,
            created_date: now,
            updated_date: now,
        }
    }

    #[tokio::test]
    async fn double_write_keeps_one_row() {
        let db = Database::in_memory().await.unwrap();
        let store = FingerprintStore::new(db.pool().clone());

        let row = sample_fingerprint(1, 11);
        store.put_fingerprints(&row).await.unwrap();
        store.put_fingerprints(&row).await.unwrap();

        let stored = store.season_fingerprints(1, 1, false).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fingerprint_data, row.fingerprint_data);
    }

    #[tokio::test]
    async fn invalid_rows_are_skipped_by_default() {
        let db = Database::in_memory().await.unwrap();
        let store = FingerprintStore::new(db.pool().clone());

        store.put_fingerprints(&sample_fingerprint(1, 11)).await.unwrap();
        store.put_fingerprints(&sample_fingerprint(2, 12)).await.unwrap();
        let invalidated = store.invalidate(1, Some(1)).await.unwrap();
        assert_eq!(invalidated, 2);

        assert!(store.season_fingerprints(1, 1, false).await.unwrap().is_empty());
        assert_eq!(store.season_fingerprints(1, 1, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn previous_seasons_are_grouped_and_limited() {
        let db = Database::in_memory().await.unwrap();
        let store = FingerprintStore::new(db.pool().clone());

        for season in 1..=4 {
            let mut row = sample_fingerprint(1, season * 10);
            row.season_number = season;
            store.put_fingerprints(&row).await.unwrap();
        }

        let previous = store.previous_season_fingerprints(1, 5, 3).await.unwrap();
        let seasons: Vec<i64> = previous.iter().map(|(s, _)| *s).collect();
        assert_eq!(seasons, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn latest_result_is_highest_confidence() {
        let db = Database::in_memory().await.unwrap();
        let store = FingerprintStore::new(db.pool().clone());

        store.put_detection_result(&sample_result(1, 11, 0.4)).await.unwrap();
        store.put_detection_result(&sample_result(2, 12, 0.9)).await.unwrap();

        let latest = store.latest_detection_result(1, 1).await.unwrap().unwrap();
        assert_eq!(latest.episode_number, 2);
        assert!((latest.confidence_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn delete_by_episode_file_removes_both_tables() {
        let db = Database::in_memory().await.unwrap();
        let store = FingerprintStore::new(db.pool().clone());

        store.put_fingerprints(&sample_fingerprint(1, 11)).await.unwrap();
        store.put_detection_result(&sample_result(1, 11, 0.5)).await.unwrap();
        store.delete_by_episode_file(11).await.unwrap();

        assert!(store.season_fingerprints(1, 1, true).await.unwrap().is_empty());
        assert!(store.latest_detection_result(1, 1).await.unwrap().is_none());
    }
}
