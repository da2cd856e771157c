//! Durable processing-job state (the store of record for the pipeline).

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::debug;

use cliprr_models::{truncate_notes, Interval, JobStatus, ProcessingJob};

use crate::error::{StoreError, StoreResult};

/// Batch size for paged deletions.
const DELETE_PAGE_SIZE: usize = 1000;

/// Partial update applied to a job row. Scalar fields are last-writer-wins;
/// status changes are validated against the transition DAG.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub intro: Option<Interval>,
    pub credits: Option<Interval>,
    pub confidence_score: Option<f64>,
    pub manual_verified: Option<bool>,
    pub processing_notes: Option<String>,
}

/// Store for processing jobs.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a fresh job for an episode file, status `scanning`.
    ///
    /// At most one job may exist per episode file; a second insert fails with
    /// [`StoreError::DuplicateJob`].
    pub async fn insert(&self, media_file_id: i64) -> StoreResult<ProcessingJob> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO processing_jobs (media_file_id, status, created_date, updated_date)
            VALUES (?, 'scanning', ?, ?)
            "#,
        )
        .bind(media_file_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(e) if StoreError::is_unique_violation(&e) => {
                return Err(StoreError::DuplicateJob(media_file_id));
            }
            Err(e) => return Err(e.into()),
        };

        let id = result.last_insert_rowid();
        debug!(job_id = id, media_file_id, "inserted processing job");

        self.get(id)
            .await?
            .ok_or(StoreError::JobNotFound(id))
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<ProcessingJob>> {
        let row = sqlx::query("SELECT * FROM processing_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn get_by_media_file(&self, media_file_id: i64) -> StoreResult<Option<ProcessingJob>> {
        let row = sqlx::query("SELECT * FROM processing_jobs WHERE media_file_id = ?")
            .bind(media_file_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// Apply a partial update with a guarded status transition.
    pub async fn update(&self, id: i64, patch: JobPatch) -> StoreResult<ProcessingJob> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM processing_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        let current = row_to_job(row)?;

        let status = match patch.status {
            Some(next) => current.status.transition(next)?,
            None => current.status,
        };

        if let Some(intro) = &patch.intro {
            validate_range("intro", intro)?;
        }
        if let Some(credits) = &patch.credits {
            validate_range("credits", credits)?;
        }

        let intro = patch.intro.or(match (current.intro_start, current.intro_end) {
            (Some(s), Some(e)) => Some(Interval::new(s, e)),
            _ => None,
        });
        let credits = patch
            .credits
            .or(match (current.credits_start, current.credits_end) {
                (Some(s), Some(e)) => Some(Interval::new(s, e)),
                _ => None,
            });
        let confidence = patch.confidence_score.or(current.confidence_score);

        // Confidence must accompany every detected/verified/completed row.
        if matches!(
            status,
            JobStatus::Detected | JobStatus::Verified | JobStatus::Completed
        ) && confidence.is_none()
        {
            return Err(StoreError::InvalidRange(format!(
                "job {id} cannot enter {status} without a confidence score"
            )));
        }

        let manual_verified = patch.manual_verified.unwrap_or(current.manual_verified);
        let notes = patch
            .processing_notes
            .map(|n| truncate_notes(&n))
            .or(current.processing_notes);

        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = ?, intro_start = ?, intro_end = ?, credits_start = ?,
                credits_end = ?, confidence_score = ?, manual_verified = ?,
                processing_notes = ?, updated_date = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(intro.map(|i| i.start))
        .bind(intro.map(|i| i.end))
        .bind(credits.map(|c| c.start))
        .bind(credits.map(|c| c.end))
        .bind(confidence)
        .bind(manual_verified)
        .bind(&notes)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get(id).await?.ok_or(StoreError::JobNotFound(id))
    }

    /// Mark a job failed with a diagnostic note. Guarded like any other
    /// transition; failing an already-terminal job is rejected.
    pub async fn fail(&self, id: i64, note: &str) -> StoreResult<ProcessingJob> {
        self.update(
            id,
            JobPatch {
                status: Some(JobStatus::Failed),
                processing_notes: Some(note.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Manual sign-off: `detected → verified` with the verified flag set.
    pub async fn mark_verified(&self, id: i64) -> StoreResult<ProcessingJob> {
        self.update(
            id,
            JobPatch {
                status: Some(JobStatus::Verified),
                manual_verified: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<ProcessingJob>> {
        let rows = sqlx::query("SELECT * FROM processing_jobs WHERE status = ? ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn list_by_show(&self, show_id: i64) -> StoreResult<Vec<ProcessingJob>> {
        let rows = sqlx::query(
            r#"
            SELECT pj.* FROM processing_jobs pj
            JOIN episode_files ef ON ef.id = pj.media_file_id
            JOIN episodes e ON e.id = ef.episode_id
            WHERE e.show_id = ?
            ORDER BY pj.id
            "#,
        )
        .bind(show_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// All job ids, for the delete-everything path.
    pub async fn all_ids(&self) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM processing_jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }

    /// Delete jobs in pages of 1000.
    pub async fn delete_batch(&self, ids: &[i64]) -> StoreResult<u64> {
        let mut deleted = 0u64;
        for page in ids.chunks(DELETE_PAGE_SIZE) {
            let placeholders = vec!["?"; page.len()].join(",");
            let sql = format!("DELETE FROM processing_jobs WHERE id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in page {
                query = query.bind(id);
            }
            deleted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    /// Resolve `(store_job_id, episode_file_id)` pairs for every episode of
    /// the given shows. Used by cleanup before the cascade delete.
    pub async fn id_and_file_for_shows(&self, show_ids: &[i64]) -> StoreResult<Vec<(i64, i64)>> {
        if show_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; show_ids.len()].join(",");
        let sql = format!(
            r#"
            SELECT pj.id AS job_id, pj.media_file_id FROM processing_jobs pj
            JOIN episode_files ef ON ef.id = pj.media_file_id
            JOIN episodes e ON e.id = ef.episode_id
            WHERE e.show_id IN ({placeholders})
            ORDER BY pj.id
            "#
        );
        let mut query = sqlx::query(&sql);
        for id in show_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| {
                Ok((
                    r.try_get::<i64, _>("job_id")?,
                    r.try_get::<i64, _>("media_file_id")?,
                ))
            })
            .collect()
    }

    /// Every job id with its episode file path. Cleanup resolves these
    /// before deleting anything so temp files can still be matched.
    pub async fn ids_and_paths(&self, ids: Option<&[i64]>) -> StoreResult<Vec<(i64, i64, String)>> {
        let base = r#"
            SELECT pj.id AS job_id, pj.media_file_id, ef.path
            FROM processing_jobs pj
            JOIN episode_files ef ON ef.id = pj.media_file_id
        "#;
        let rows = match ids {
            None => sqlx::query(&format!("{base} ORDER BY pj.id"))
                .fetch_all(&self.pool)
                .await?,
            Some(ids) if ids.is_empty() => return Ok(Vec::new()),
            Some(ids) => {
                let placeholders = vec!["?"; ids.len()].join(",");
                let sql = format!("{base} WHERE pj.id IN ({placeholders}) ORDER BY pj.id");
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                query.fetch_all(&self.pool).await?
            }
        };
        rows.into_iter()
            .map(|r| {
                Ok((
                    r.try_get::<i64, _>("job_id")?,
                    r.try_get::<i64, _>("media_file_id")?,
                    r.try_get::<String, _>("path")?,
                ))
            })
            .collect()
    }

    /// Job counts grouped by status, plus the total.
    pub async fn status_counts(&self) -> StoreResult<(i64, BTreeMap<String, i64>)> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM processing_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut by_status = BTreeMap::new();
        let mut total = 0i64;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            total += n;
            by_status.insert(status, n);
        }
        Ok((total, by_status))
    }
}

fn validate_range(label: &str, range: &Interval) -> StoreResult<()> {
    if range.start < 0.0 || range.end < range.start {
        return Err(StoreError::InvalidRange(format!(
            "{label} range {:.2}..{:.2} is not ordered and non-negative",
            range.start, range.end
        )));
    }
    Ok(())
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> StoreResult<ProcessingJob> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| {
        StoreError::InvalidRange(format!("unknown job status in store: {status_str}"))
    })?;

    Ok(ProcessingJob {
        id: row.try_get("id")?,
        media_file_id: row.try_get("media_file_id")?,
        status,
        intro_start: row.try_get("intro_start")?,
        intro_end: row.try_get("intro_end")?,
        credits_start: row.try_get("credits_start")?,
        credits_end: row.try_get("credits_end")?,
        confidence_score: row.try_get("confidence_score")?,
        manual_verified: row.try_get("manual_verified")?,
        processing_notes: row.try_get("processing_notes")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
    })
}
