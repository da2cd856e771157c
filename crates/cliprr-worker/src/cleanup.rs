//! Cleanup coordinator: delete jobs or shows across both stores, the
//! queues, and the temp tree.
//!
//! Both operations run on the `cleanup` queue (concurrency 1) so they
//! serialize with themselves. Broker removal happens before store deletion
//! for per-job deletes so no worker can resurrect state in between.

use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{info, warn};

use cliprr_models::{PAUSE_GROUP_CPU, PAUSE_GROUP_GPU};

use crate::context::WorkerContext;
use crate::error::WorkerResult;
use crate::trim;

/// Process-name patterns killed during a delete-all. Host-wide and racy by
/// nature, which is why this never runs outside cleanup.
const KILL_PATTERNS: [&str; 2] = ["ffmpeg", "fpcalc"];

/// What a cleanup run touched.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub jobs_deleted: u64,
    pub broker_entries_removed: usize,
    pub temp_files_removed: usize,
}

pub struct CleanupCoordinator {
    ctx: Arc<WorkerContext>,
}

impl CleanupCoordinator {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Delete processing jobs. With `all`, the whole pipeline is wiped:
    /// workers pause, external tools die, every queue drains, the
    /// coordination store flushes, and the store rows plus temp files go.
    pub async fn delete_processing_jobs(
        &self,
        job_ids: Vec<i64>,
        all: bool,
    ) -> WorkerResult<CleanupReport> {
        if all {
            self.delete_all_jobs().await
        } else {
            self.delete_some_jobs(&job_ids).await
        }
    }

    async fn delete_all_jobs(&self) -> WorkerResult<CleanupReport> {
        let mut report = CleanupReport::default();
        info!("delete-all cleanup starting");

        // Stop the workers and kill whatever the runners had in flight.
        for queue in PAUSE_GROUP_CPU.iter().chain(PAUSE_GROUP_GPU.iter()) {
            self.ctx.broker.pause(*queue, true).await?;
        }
        kill_external_tools().await;

        // Resolve temp-file targets before the rows disappear.
        let targets = self.ctx.jobs.ids_and_paths(None).await?;

        // Drain every state of every queue, then flush the coordination
        // store outright (queues, semaphore).
        for queue in cliprr_models::QueueName::ALL {
            report.broker_entries_removed += self.ctx.broker.drain_queue(queue).await?;
        }
        self.ctx.broker.flush_all().await?;
        self.ctx.semaphore.reset().await?;

        for queue in PAUSE_GROUP_CPU.iter().chain(PAUSE_GROUP_GPU.iter()) {
            self.ctx.broker.resume(*queue).await?;
        }

        // Store rows go in pages of 1000.
        let ids: Vec<i64> = targets.iter().map(|(job_id, _, _)| *job_id).collect();
        report.jobs_deleted = self.ctx.jobs.delete_batch(&ids).await?;

        report.temp_files_removed = self.remove_temp_files(&targets).await;

        info!(
            jobs = report.jobs_deleted,
            broker_entries = report.broker_entries_removed,
            temp_files = report.temp_files_removed,
            "delete-all cleanup finished"
        );
        Ok(report)
    }

    async fn delete_some_jobs(&self, job_ids: &[i64]) -> WorkerResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let targets = self.ctx.jobs.ids_and_paths(Some(job_ids)).await?;

        // Broker first: a worker must not be able to resurrect the job
        // between the two deletions.
        report.broker_entries_removed = self
            .ctx
            .broker
            .remove_by_store_job_ids(job_ids)
            .await?;

        for (_, episode_file_id, _) in &targets {
            self.ctx
                .fingerprints
                .delete_by_episode_file(*episode_file_id)
                .await?;
        }
        report.jobs_deleted = self.ctx.jobs.delete_batch(job_ids).await?;
        report.temp_files_removed = self.remove_temp_files(&targets).await;

        info!(
            jobs = report.jobs_deleted,
            broker_entries = report.broker_entries_removed,
            "job cleanup finished"
        );
        Ok(report)
    }

    /// Delete shows and every queue entry referencing their jobs. Job and
    /// file pairs are resolved before the cascade wipes them.
    pub async fn delete_shows_and_cleanup(&self, show_ids: &[i64]) -> WorkerResult<CleanupReport> {
        let mut report = CleanupReport::default();

        let pairs = self.ctx.jobs.id_and_file_for_shows(show_ids).await?;
        let job_ids: Vec<i64> = pairs.iter().map(|(job_id, _)| *job_id).collect();
        let targets = self.ctx.jobs.ids_and_paths(Some(&job_ids)).await?;

        // Shows cascade to seasons, episodes, files, and jobs.
        self.ctx.catalog.delete_shows(show_ids).await?;
        report.jobs_deleted = job_ids.len() as u64;

        report.broker_entries_removed = self
            .ctx
            .broker
            .remove_by_store_job_ids(&job_ids)
            .await?;

        for (_, episode_file_id) in &pairs {
            self.ctx
                .fingerprints
                .delete_by_episode_file(*episode_file_id)
                .await?;
        }
        report.temp_files_removed = self.remove_temp_files(&targets).await;

        info!(
            shows = show_ids.len(),
            jobs = job_ids.len(),
            broker_entries = report.broker_entries_removed,
            "show cleanup finished"
        );
        Ok(report)
    }

    /// Remove the per-job temp files. Missing files are expected and
    /// ignored.
    async fn remove_temp_files(&self, targets: &[(i64, i64, String)]) -> usize {
        let temp = &self.ctx.config.temp_dir;
        let trimmed_dir = temp.join("trimmed");
        let mut removed = 0usize;

        for (job_id, _, path) in targets {
            let mut candidates = vec![
                trim::intro_path(&trimmed_dir, *job_id),
                trim::credits_path(&trimmed_dir, *job_id),
            ];
            if let Some(stem) = Path::new(path).file_stem() {
                candidates.push(temp.join("audio").join(format!(
                    "{}.wav",
                    stem.to_string_lossy()
                )));
            }
            for candidate in candidates {
                match tokio::fs::remove_file(&candidate).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(file = %candidate.display(), "temp removal failed: {e}"),
                }
            }
        }
        removed
    }
}

/// Best-effort kill of the external audio tooling by process name.
async fn kill_external_tools() {
    for pattern in KILL_PATTERNS {
        match Command::new("pkill").args(["-f", pattern]).status().await {
            Ok(status) => info!(pattern, code = ?status.code(), "pkill issued"),
            Err(e) => warn!(pattern, "pkill unavailable: {e}"),
        }
    }
}
