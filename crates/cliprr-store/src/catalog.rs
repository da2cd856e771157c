//! Catalog persistence: show import and cascading deletion.
//!
//! The catalog content comes from the external importer; the transaction
//! boundaries here are what the core guarantees: a show arrives atomically
//! (show + seasons + episodes + initial jobs) and leaves atomically.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::info;

use cliprr_models::{EpisodeFile, EpisodeFileRef, ProcessingJob, Show};

use crate::error::{StoreError, StoreResult};

/// One show as delivered by the importer.
#[derive(Debug, Clone)]
pub struct ShowImport {
    pub title: String,
    pub seasons: Vec<SeasonImport>,
}

#[derive(Debug, Clone)]
pub struct SeasonImport {
    pub season_number: i64,
    pub episodes: Vec<EpisodeImport>,
}

#[derive(Debug, Clone)]
pub struct EpisodeImport {
    pub episode_number: i64,
    pub title: String,
    pub file_path: String,
    pub file_size: i64,
}

/// Store for catalog rows.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Import a show with all seasons, episodes, files, and one initial
    /// `scanning` job per file, in a single transaction.
    pub async fn import_show(&self, import: &ShowImport) -> StoreResult<Show> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let show_id = sqlx::query("INSERT INTO shows (title, created_date) VALUES (?, ?)")
            .bind(&import.title)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for season in &import.seasons {
            let season_id =
                sqlx::query("INSERT INTO seasons (show_id, season_number) VALUES (?, ?)")
                    .bind(show_id)
                    .bind(season.season_number)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid();

            for episode in &season.episodes {
                let episode_id = sqlx::query(
                    r#"
                    INSERT INTO episodes (season_id, show_id, season_number, episode_number, title)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(season_id)
                .bind(show_id)
                .bind(season.season_number)
                .bind(episode.episode_number)
                .bind(&episode.title)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

                let file_id =
                    sqlx::query("INSERT INTO episode_files (episode_id, path, size) VALUES (?, ?, ?)")
                        .bind(episode_id)
                        .bind(&episode.file_path)
                        .bind(episode.file_size)
                        .execute(&mut *tx)
                        .await?
                        .last_insert_rowid();

                sqlx::query(
                    r#"
                    INSERT INTO processing_jobs (media_file_id, status, created_date, updated_date)
                    VALUES (?, 'scanning', ?, ?)
                    "#,
                )
                .bind(file_id)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!(show_id, title = %import.title, "imported show");

        Ok(Show {
            id: show_id,
            title: import.title.clone(),
            created_date: now,
        })
    }

    /// Cascade-delete shows in a single transaction. Seasons, episodes,
    /// files, and jobs go with them via FK cascade.
    pub async fn delete_shows(&self, show_ids: &[i64]) -> StoreResult<u64> {
        if show_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let placeholders = vec!["?"; show_ids.len()].join(",");
        let sql = format!("DELETE FROM shows WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in show_ids {
            query = query.bind(id);
        }
        let deleted = query.execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        info!(count = deleted, "deleted shows");
        Ok(deleted)
    }

    /// Look up an episode file with its catalog coordinates.
    pub async fn episode_file_ref(&self, episode_file_id: i64) -> StoreResult<Option<EpisodeFileRef>> {
        let row = sqlx::query(
            r#"
            SELECT ef.id, ef.episode_id, ef.path, ef.size,
                   e.show_id, e.season_number, e.episode_number, s.title AS show_title
            FROM episode_files ef
            JOIN episodes e ON e.id = ef.episode_id
            JOIN shows s ON s.id = e.show_id
            WHERE ef.id = ?
            "#,
        )
        .bind(episode_file_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, StoreError>(EpisodeFileRef {
                file: EpisodeFile {
                    id: r.try_get("id")?,
                    episode_id: r.try_get("episode_id")?,
                    path: r.try_get("path")?,
                    size: r.try_get("size")?,
                },
                show_id: r.try_get("show_id")?,
                show_title: r.try_get("show_title")?,
                season_number: r.try_get("season_number")?,
                episode_number: r.try_get("episode_number")?,
            })
        })
        .transpose()
    }

    /// Jobs created for a show (import creates one per episode file).
    pub async fn jobs_for_show(&self, show_id: i64) -> StoreResult<Vec<ProcessingJob>> {
        crate::jobs::JobStore::new(self.pool.clone())
            .list_by_show(show_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::fingerprints::FingerprintStore;

    fn two_episode_show() -> ShowImport {
        ShowImport {
            title: "Cascade".into(),
            seasons: vec![SeasonImport {
                season_number: 1,
                episodes: vec![
                    EpisodeImport {
                        episode_number: 1,
                        title: "One".into(),
                        file_path: "/m/s01e01.mkv".into(),
                        file_size: 10,
                    },
                    EpisodeImport {
                        episode_number: 2,
                        title: "Two".into(),
                        file_path: "/m/s01e02.mkv".into(),
                        file_size: 20,
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    async fn import_creates_jobs_atomically() {
        let db = Database::in_memory().await.unwrap();
        let catalog = CatalogStore::new(db.pool().clone());

        let show = catalog.import_show(&two_episode_show()).await.unwrap();
        let jobs = catalog.jobs_for_show(show.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status.as_str() == "scanning"));
    }

    #[tokio::test]
    async fn delete_show_cascades_to_jobs() {
        let db = Database::in_memory().await.unwrap();
        let catalog = CatalogStore::new(db.pool().clone());

        let show = catalog.import_show(&two_episode_show()).await.unwrap();
        assert_eq!(catalog.delete_shows(&[show.id]).await.unwrap(), 1);

        let jobs = catalog.jobs_for_show(show.id).await.unwrap();
        assert!(jobs.is_empty());

        let row = sqlx::query("SELECT COUNT(*) AS n FROM episode_files")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn episode_file_ref_joins_catalog() {
        let db = Database::in_memory().await.unwrap();
        let catalog = CatalogStore::new(db.pool().clone());
        let show = catalog.import_show(&two_episode_show()).await.unwrap();
        let jobs = catalog.jobs_for_show(show.id).await.unwrap();

        let file_ref = catalog
            .episode_file_ref(jobs[0].media_file_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file_ref.show_title, "Cascade");
        assert_eq!(file_ref.season_number, 1);
        assert_eq!(file_ref.episode_number, 1);
        assert_eq!(file_ref.file.path, "/m/s01e01.mkv");

        // Fingerprint store is untouched by catalog deletion (different
        // lifecycle; cleanup handles it explicitly).
        let fps = FingerprintStore::new(db.pool().clone());
        assert!(fps.season_fingerprints(show.id, 1, true).await.unwrap().is_empty());
    }
}
