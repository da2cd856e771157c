//! Season detection runner: load, cluster, preserve, approve, write.

use chrono::Utc;
use tracing::{debug, info, warn};

use cliprr_models::{
    truncate_notes, ApprovalStatus, DetectionMethod, DetectionResult, EpisodeFingerprint,
    Interval, JobStatus,
};
use cliprr_store::{FingerprintStore, JobPatch, JobStore, SettingsStore, StoreError};

use crate::clustering::{cluster_season, should_preserve_existing, DetectorOptions, SeasonClusters};
use crate::DetectResult;

/// Minimum current-season episodes before cross-season fallback kicks in.
const MIN_CURRENT_SEASON_EPISODES: usize = 3;

/// How many previous seasons the fallback may pull in.
const CROSS_SEASON_LIMIT: usize = 3;

/// Summary of one detection run.
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub success: bool,
    pub confidence: f64,
    pub method: DetectionMethod,
    /// The stored result won under the preservation policy
    pub preserved: bool,
    pub episodes_written: usize,
}

impl DetectionOutcome {
    fn none() -> Self {
        Self {
            success: false,
            confidence: 0.0,
            method: DetectionMethod::None,
            preserved: false,
            episodes_written: 0,
        }
    }
}

/// The season detector.
#[derive(Clone)]
pub struct SeasonDetector {
    fingerprints: FingerprintStore,
    jobs: JobStore,
    settings: SettingsStore,
}

impl SeasonDetector {
    pub fn new(fingerprints: FingerprintStore, jobs: JobStore, settings: SettingsStore) -> Self {
        Self {
            fingerprints,
            jobs,
            settings,
        }
    }

    /// Detect common segments for one season and persist the outcome.
    pub async fn detect(
        &self,
        show_id: i64,
        season_number: i64,
        options: &DetectorOptions,
    ) -> DetectResult<DetectionOutcome> {
        let current = self
            .fingerprints
            .season_fingerprints(show_id, season_number, false)
            .await?;

        let mut method = DetectionMethod::CurrentSeason;
        let mut combined: Vec<EpisodeFingerprint> = current.clone();

        if current.len() < MIN_CURRENT_SEASON_EPISODES {
            let previous = self
                .fingerprints
                .previous_season_fingerprints(show_id, season_number, CROSS_SEASON_LIMIT)
                .await?;
            if !previous.is_empty() {
                method = DetectionMethod::CrossSeason;
                for (_, rows) in previous {
                    combined.extend(rows);
                }
            }
        }

        if combined.is_empty() {
            info!(show_id, season_number, "no fingerprints available, skipping detection");
            return Ok(DetectionOutcome::none());
        }

        let clusters = cluster_season(&combined, options);
        debug!(
            show_id,
            season_number,
            clusters = clusters.clusters.len(),
            confidence = clusters.confidence,
            method = method.as_str(),
            "season clustered"
        );

        // Preservation policy: a strong stored result survives a weak rerun.
        if let Some(existing) = self
            .fingerprints
            .latest_detection_result(show_id, season_number)
            .await?
        {
            if should_preserve_existing(
                existing.confidence_score,
                existing.has_detection(),
                clusters.confidence,
                clusters.has_detection(),
            ) {
                info!(
                    show_id,
                    season_number,
                    existing = existing.confidence_score,
                    new = clusters.confidence,
                    "keeping existing detection result"
                );
                return Ok(DetectionOutcome {
                    success: existing.has_detection(),
                    confidence: existing.confidence_score,
                    method,
                    preserved: true,
                    episodes_written: 0,
                });
            }
        }

        let approval = self.approval_for(clusters.confidence).await?;

        // Results are written for current-season episodes only, never for
        // the pulled-in previous seasons.
        let mut written = 0usize;
        for episode in &current {
            self.write_episode_result(episode, &clusters, method, approval)
                .await?;
            written += 1;
        }

        Ok(DetectionOutcome {
            success: clusters.has_detection(),
            confidence: clusters.confidence,
            method,
            preserved: false,
            episodes_written: written,
        })
    }

    async fn approval_for(&self, confidence: f64) -> DetectResult<ApprovalStatus> {
        let threshold = self.settings.min_confidence_threshold().await?;
        let auto = self.settings.auto_process_detections().await?;
        if auto && confidence >= threshold {
            Ok(ApprovalStatus::AutoApproved)
        } else {
            Ok(ApprovalStatus::Pending)
        }
    }

    async fn write_episode_result(
        &self,
        episode: &EpisodeFingerprint,
        clusters: &SeasonClusters,
        method: DetectionMethod,
        approval: ApprovalStatus,
    ) -> DetectResult<()> {
        let clamp = |i: &Interval| {
            Interval::new(
                i.start.clamp(0.0, episode.file_duration),
                i.end.clamp(0.0, episode.file_duration),
            )
        };
        let intro = clusters.intro.as_ref().map(|i| clamp(i));
        let credits = clusters.credits.as_ref().map(|c| clamp(c));

        let notes = truncate_notes(&format!(
            "method={}; clusters={}; episodes={}",
            method.as_str(),
            clusters.clusters.len(),
            clusters.total_episodes
        ));
        let now = Utc::now();

        self.fingerprints
            .put_detection_result(&DetectionResult {
                show_id: episode.show_id,
                season_number: episode.season_number,
                episode_number: episode.episode_number,
                episode_file_id: episode.episode_file_id,
                intro,
                credits,
                stingers: clusters.stingers.iter().map(|s| clamp(s)).collect(),
                segments: clusters.clusters.clone(),
                confidence_score: clusters.confidence,
                detection_method: method,
                approval_status: approval,
                processing_notes: Some(notes),
                created_date: now,
                updated_date: now,
            })
            .await?;

        // Mirror the outcome onto the job row. Jobs that have not reached a
        // state that can advance (still enqueued) are skipped; their own
        // pipeline run will pick the result up.
        let Some(job) = self.jobs.get_by_media_file(episode.episode_file_id).await? else {
            debug!(
                episode_file_id = episode.episode_file_id,
                "no job row for episode file, skipping job update"
            );
            return Ok(());
        };

        let status = if approval.is_approved() {
            JobStatus::Verified
        } else {
            JobStatus::Detected
        };

        let patch = JobPatch {
            status: Some(status),
            intro,
            credits,
            confidence_score: Some(clusters.confidence),
            ..Default::default()
        };

        match self.jobs.update(job.id, patch).await {
            Ok(_) => {}
            Err(StoreError::IllegalTransition(e)) => {
                warn!(job_id = job.id, error = %e, "job not ready for detection result");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliprr_models::FingerprintEntry;
    use cliprr_store::{
        CatalogStore, Database, EpisodeImport, SeasonImport, SettingsStore, ShowImport,
    };

    struct Fixture {
        db: Database,
        detector: SeasonDetector,
        show_id: i64,
        file_ids: Vec<i64>,
    }

    /// Import a show with `counts[i]` episodes in season `i + 1`, advance
    /// every job to `processing`, and return the per-file ids in import
    /// order.
    async fn fixture(counts: &[usize]) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let catalog = CatalogStore::new(db.pool().clone());
        let jobs = JobStore::new(db.pool().clone());

        let show = catalog
            .import_show(&ShowImport {
                title: "Fixture".into(),
                seasons: counts
                    .iter()
                    .enumerate()
                    .map(|(i, n)| SeasonImport {
                        season_number: (i + 1) as i64,
                        episodes: (1..=*n)
                            .map(|e| EpisodeImport {
                                episode_number: e as i64,
                                title: format!("E{e}"),
                                file_path: format!("/m/s{:02}e{e:02}.mkv", i + 1),
                                file_size: 1,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .await
            .unwrap();

        let mut file_ids = Vec::new();
        for job in catalog.jobs_for_show(show.id).await.unwrap() {
            jobs.update(
                job.id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            file_ids.push(job.media_file_id);
        }

        let detector = SeasonDetector::new(
            FingerprintStore::new(db.pool().clone()),
            jobs,
            SettingsStore::new(db.pool().clone()),
        );

        Fixture {
            db,
            detector,
            show_id: show.id,
            file_ids,
        }
    }

    fn intro_fingerprints(
        show_id: i64,
        season: i64,
        episode: i64,
        file_id: i64,
    ) -> EpisodeFingerprint {
        EpisodeFingerprint::new(
            show_id,
            season,
            episode,
            file_id,
            vec![
                FingerprintEntry {
                    offset_seconds: 5.0,
                    fingerprint: "intro-a".into(),
                },
                FingerprintEntry {
                    offset_seconds: 15.0,
                    fingerprint: "intro-b".into(),
                },
                FingerprintEntry {
                    offset_seconds: 25.0,
                    fingerprint: "intro-c".into(),
                },
                FingerprintEntry {
                    offset_seconds: 35.0,
                    fingerprint: "intro-d".into(),
                },
            ],
            1800.0,
            1,
        )
    }

    #[tokio::test]
    async fn full_season_detects_and_marks_jobs() {
        let fx = fixture(&[6]).await;
        let fps = FingerprintStore::new(fx.db.pool().clone());
        for (i, file_id) in fx.file_ids.iter().enumerate() {
            fps.put_fingerprints(&intro_fingerprints(
                fx.show_id,
                1,
                (i + 1) as i64,
                *file_id,
            ))
            .await
            .unwrap();
        }

        let outcome = fx
            .detector
            .detect(fx.show_id, 1, &DetectorOptions::default())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.method, DetectionMethod::CurrentSeason);
        assert_eq!(outcome.episodes_written, 6);
        assert!((outcome.confidence - 0.9).abs() < 1e-9);

        let jobs = JobStore::new(fx.db.pool().clone());
        for file_id in &fx.file_ids {
            let job = jobs.get_by_media_file(*file_id).await.unwrap().unwrap();
            // auto_process_detections defaults to false
            assert_eq!(job.status, JobStatus::Detected);
            assert_eq!(job.intro_start, Some(0.0));
            assert_eq!(job.intro_end, Some(50.0));
        }
    }

    #[tokio::test]
    async fn sparse_season_falls_back_to_previous_seasons() {
        // Season 1: three episodes, season 2: two episodes.
        let fx = fixture(&[3, 2]).await;
        let fps = FingerprintStore::new(fx.db.pool().clone());
        for (i, file_id) in fx.file_ids.iter().enumerate() {
            let (season, episode) = if i < 3 { (1, i + 1) } else { (2, i - 2) };
            fps.put_fingerprints(&intro_fingerprints(
                fx.show_id,
                season,
                episode as i64,
                *file_id,
            ))
            .await
            .unwrap();
        }

        let outcome = fx
            .detector
            .detect(fx.show_id, 2, &DetectorOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.method, DetectionMethod::CrossSeason);
        // Current season only: the two season-2 episodes.
        assert_eq!(outcome.episodes_written, 2);

        let results = fps.season_detection_results(fx.show_id, 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(fps
            .season_detection_results(fx.show_id, 1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn no_fingerprints_yields_none() {
        let fx = fixture(&[3]).await;
        let outcome = fx
            .detector
            .detect(fx.show_id, 1, &DetectorOptions::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.method, DetectionMethod::None);
        assert_eq!(outcome.confidence, 0.0);
    }

    #[tokio::test]
    async fn auto_approval_verifies_jobs() {
        let fx = fixture(&[6]).await;
        let settings = SettingsStore::new(fx.db.pool().clone());
        settings.set("auto_process_detections", "true").await.unwrap();
        settings.set("min_confidence_threshold", "0.8").await.unwrap();

        let fps = FingerprintStore::new(fx.db.pool().clone());
        for (i, file_id) in fx.file_ids.iter().enumerate() {
            fps.put_fingerprints(&intro_fingerprints(
                fx.show_id,
                1,
                (i + 1) as i64,
                *file_id,
            ))
            .await
            .unwrap();
        }

        let outcome = fx
            .detector
            .detect(fx.show_id, 1, &DetectorOptions::default())
            .await
            .unwrap();
        assert!(outcome.confidence >= 0.8);

        let results = fps.season_detection_results(fx.show_id, 1).await.unwrap();
        assert!(results
            .iter()
            .all(|r| r.approval_status == ApprovalStatus::AutoApproved));

        let jobs = JobStore::new(fx.db.pool().clone());
        for file_id in &fx.file_ids {
            let job = jobs.get_by_media_file(*file_id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Verified);
        }
    }

    #[tokio::test]
    async fn noop_rerun_preserves_existing_result() {
        let fx = fixture(&[6]).await;
        let fps = FingerprintStore::new(fx.db.pool().clone());
        for (i, file_id) in fx.file_ids.iter().enumerate() {
            fps.put_fingerprints(&intro_fingerprints(
                fx.show_id,
                1,
                (i + 1) as i64,
                *file_id,
            ))
            .await
            .unwrap();
        }

        let first = fx
            .detector
            .detect(fx.show_id, 1, &DetectorOptions::default())
            .await
            .unwrap();
        assert!(!first.preserved);

        let before = fps.season_detection_results(fx.show_id, 1).await.unwrap();

        let second = fx
            .detector
            .detect(fx.show_id, 1, &DetectorOptions::default())
            .await
            .unwrap();
        assert!(second.preserved);
        assert_eq!(second.episodes_written, 0);

        let after = fps.season_detection_results(fx.show_id, 1).await.unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.updated_date, a.updated_date);
        }
    }
}
