//! Stage dispatch: one processor per queue, matched on the job tag.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use cliprr_detect::DetectorOptions;
use cliprr_queue::{BrokerRecord, CleanupOp, QueuedJob};

use crate::cleanup::CleanupCoordinator;
use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::extractor;
use crate::trim;

/// Run one reserved job to completion.
pub async fn process_job(
    ctx: &Arc<WorkerContext>,
    record: &BrokerRecord,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    match &record.job {
        QueuedJob::EpisodeProcessing(job) => {
            let summary =
                extractor::extract_episode(ctx, job.store_job_id, job.episode_file_id, cancel_rx)
                    .await?;
            ctx.detector
                .detect(
                    summary.show_id,
                    summary.season_number,
                    &DetectorOptions::default(),
                )
                .await?;
            Ok(())
        }

        QueuedJob::AudioExtraction(job) => {
            let file_ref = extractor::load_file_ref(ctx, job.episode_file_id).await?;
            let info = extractor::probe_episode(&file_ref).await?;
            let wav = extractor::decode_stage(ctx, &file_ref, info.duration, cancel_rx).await?;
            info!(
                store_job_id = job.store_job_id,
                wav = %wav.display(),
                "audio extracted"
            );
            Ok(())
        }

        QueuedJob::Fingerprinting(job) => {
            let file_ref = extractor::load_file_ref(ctx, job.episode_file_id).await?;
            let wav = ctx
                .config
                .temp_dir
                .join("audio")
                .join(extractor::wav_name(&file_ref));
            if tokio::fs::metadata(&wav).await.is_err() {
                return Err(WorkerError::processing_failed(format!(
                    "decoded audio missing for episode file {}; audio-extraction must run first",
                    job.episode_file_id
                )));
            }

            let info = extractor::probe_episode(&file_ref).await?;
            let run_dir = ctx.config.temp_dir.join(uuid::Uuid::new_v4().to_string());
            tokio::fs::create_dir_all(&run_dir).await?;

            let result = extractor::fingerprint_windows(
                ctx,
                &wav,
                &run_dir,
                info.duration,
                cancel_rx,
                None,
            )
            .await;
            let _ = tokio::fs::remove_dir_all(&run_dir).await;
            let (entries, skipped, total) = result?;

            ctx.fingerprints
                .put_fingerprints(&cliprr_models::EpisodeFingerprint::new(
                    file_ref.show_id,
                    file_ref.season_number,
                    file_ref.episode_number,
                    file_ref.file.id,
                    entries,
                    info.duration,
                    info.size as i64,
                ))
                .await?;
            info!(
                store_job_id = job.store_job_id,
                skipped, total, "fingerprinting stage complete"
            );
            Ok(())
        }

        QueuedJob::Detection(job) => {
            let outcome = ctx
                .detector
                .detect(job.show_id, job.season_number, &DetectorOptions::default())
                .await?;
            info!(
                show_id = job.show_id,
                season = job.season_number,
                confidence = outcome.confidence,
                method = outcome.method.as_str(),
                "detection stage complete"
            );
            Ok(())
        }

        QueuedJob::Trimming(job) => {
            trim::trim_job(ctx, job.store_job_id, job.episode_file_id, cancel_rx).await
        }

        QueuedJob::Cleanup(job) => {
            let coordinator = CleanupCoordinator::new(Arc::clone(ctx));
            match &job.op {
                CleanupOp::DeleteJobs { job_ids, all } => {
                    coordinator.delete_processing_jobs(job_ids.clone(), *all).await?;
                }
                CleanupOp::DeleteShows { show_ids } => {
                    coordinator.delete_shows_and_cleanup(show_ids).await?;
                }
            }
            Ok(())
        }
    }
}
