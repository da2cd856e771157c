//! Trimming stage: cut approved intro/credits ranges out to files.
//!
//! This is the stage boundary only; the cuts are stream copies and codec
//! choices stay with the external surface.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use cliprr_media::{ToolCommand, ToolRunner};
use cliprr_models::{Interval, JobStatus};
use cliprr_store::JobPatch;

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};

/// Cut the approved ranges for a verified job and advance it to completed.
pub async fn trim_job(
    ctx: &Arc<WorkerContext>,
    store_job_id: i64,
    episode_file_id: i64,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let job = ctx
        .jobs
        .get(store_job_id)
        .await?
        .ok_or_else(|| WorkerError::guard_breach(format!("job {store_job_id} has no store row")))?;

    if job.status != JobStatus::Verified {
        return Err(WorkerError::job_failed(format!(
            "job {store_job_id} is {} but trimming requires verified",
            job.status
        )));
    }

    let file_ref = ctx
        .catalog
        .episode_file_ref(episode_file_id)
        .await?
        .ok_or_else(|| {
            WorkerError::guard_breach(format!("episode file {episode_file_id} has no catalog row"))
        })?;

    let trimmed_dir = ctx.config.temp_dir.join("trimmed");
    tokio::fs::create_dir_all(&trimmed_dir).await?;

    let intro = match (job.intro_start, job.intro_end) {
        (Some(s), Some(e)) => Some(Interval::new(s, e)),
        _ => None,
    };
    let credits = match (job.credits_start, job.credits_end) {
        (Some(s), Some(e)) => Some(Interval::new(s, e)),
        _ => None,
    };

    if let Some(range) = intro {
        let out = intro_path(&trimmed_dir, store_job_id);
        cut_range(&file_ref.file.path, &out, range, cancel_rx.clone()).await?;
    }
    if let Some(range) = credits {
        let out = credits_path(&trimmed_dir, store_job_id);
        cut_range(&file_ref.file.path, &out, range, cancel_rx).await?;
    }

    ctx.jobs
        .update(
            store_job_id,
            JobPatch {
                status: Some(JobStatus::Completed),
                ..Default::default()
            },
        )
        .await?;

    info!(store_job_id, episode_file_id, "trimming complete");
    Ok(())
}

pub fn intro_path(trimmed_dir: &std::path::Path, job_id: i64) -> PathBuf {
    trimmed_dir.join(format!("intro_{job_id}.mp4"))
}

pub fn credits_path(trimmed_dir: &std::path::Path, job_id: i64) -> PathBuf {
    trimmed_dir.join(format!("credits_{job_id}.mp4"))
}

async fn cut_range(
    input: &str,
    output: &std::path::Path,
    range: Interval,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let cmd = ToolCommand::new("ffmpeg")
        .args(["-y", "-v", "error"])
        .args(["-ss", &format!("{:.3}", range.start)])
        .args(["-t", &format!("{:.3}", range.duration())])
        .args(["-i", input])
        .args(["-c", "copy"])
        .arg(output.to_string_lossy().into_owned())
        .expect_output(output);

    ToolRunner::new().with_cancel(cancel_rx).run(&cmd).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmed_paths_match_cleanup_layout() {
        let dir = std::path::Path::new("/tmp/cliprr/trimmed");
        assert_eq!(
            intro_path(dir, 42),
            PathBuf::from("/tmp/cliprr/trimmed/intro_42.mp4")
        );
        assert_eq!(
            credits_path(dir, 42),
            PathBuf::from("/tmp/cliprr/trimmed/credits_42.mp4")
        );
    }
}
