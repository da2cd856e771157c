//! Fingerprint extraction pipeline.
//!
//! For one episode file: probe, decode + filter, chunk + fingerprint, and
//! persist the fingerprint stream. Progress flows through the bus as both
//! `audio_extraction_progress` and `job_update` messages.
//!
//! The decode and fingerprint stages are also exposed on their own for the
//! `audio-extraction` and `fingerprinting` queues.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cliprr_media::{
    chunk_offsets, decode_filtered_audio, extract_chunk, fingerprint_chunk, probe_media, MediaInfo,
};
use cliprr_models::{
    broker_job_id, BusMessage, CurrentFile, EpisodeFileRef, EpisodeFingerprint, FingerprintEntry,
    JobStatus,
};
use cliprr_store::JobPatch;

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};

/// A run that loses more than this share of its chunks is a failure.
const MIN_CHUNK_SUCCESS_RATIO: f64 = 0.25;

/// Outcome of one extraction run, handed to the detection trigger.
#[derive(Debug, Clone)]
pub struct ExtractionSummary {
    pub show_id: i64,
    pub season_number: i64,
    pub episode_file_id: i64,
    pub windows: usize,
    pub skipped: usize,
    pub duration: f64,
}

/// Extract and persist the fingerprint stream for one episode file.
pub async fn extract_episode(
    ctx: &Arc<WorkerContext>,
    store_job_id: i64,
    episode_file_id: i64,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<ExtractionSummary> {
    let file_ref = load_file_ref(ctx, episode_file_id).await?;

    // Enqueued -> picked up. A job already in processing (restart recovery)
    // re-asserts the same state.
    ctx.jobs
        .update(
            store_job_id,
            JobPatch {
                status: Some(JobStatus::Processing),
                ..Default::default()
            },
        )
        .await?;

    let broker_id = broker_job_id(store_job_id);
    let current_file = CurrentFile {
        file_id: file_ref.file.id,
        file_path: file_ref.file.path.clone(),
        episode: file_ref.episode_number,
        season: file_ref.season_number,
        show: file_ref.show_title.clone(),
    };
    let progress = move |pct: u8| {
        BusMessage::job_progress(&broker_id, store_job_id, pct, Some(current_file.clone()))
    };

    // Stage 1: analyze.
    let mut notes: Vec<String> = Vec::new();
    let info = probe_episode(&file_ref).await?;
    for advisory in info.advisories() {
        notes.push(advisory.to_string());
    }
    ctx.bus.publish(progress(5)).await;

    // Stage 2: decode + filter, under the global decode budget.
    let wav_path = decode_stage(ctx, &file_ref, info.duration, cancel_rx.clone()).await?;
    ctx.bus.publish(progress(50)).await;

    // Stage 3: chunk + fingerprint in a per-run directory that goes away on
    // every exit path.
    let run_dir = ctx.config.temp_dir.join(uuid::Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&run_dir).await?;

    let result = fingerprint_windows(
        ctx,
        &wav_path,
        &run_dir,
        info.duration,
        cancel_rx,
        Some(&progress),
    )
    .await;

    if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %run_dir.display(), "failed to remove chunk dir: {e}");
        }
    }

    let (entries, skipped, total) = result?;

    if total > 0 && (total - skipped) as f64 / (total as f64) < MIN_CHUNK_SUCCESS_RATIO {
        return Err(WorkerError::processing_failed(format!(
            "only {} of {} chunks fingerprinted",
            total - skipped,
            total
        )));
    }
    if skipped > 0 {
        notes.push(format!("skipped_chunks={skipped}/{total}"));
    }

    // Stage 4: persist.
    ctx.fingerprints
        .put_fingerprints(&EpisodeFingerprint::new(
            file_ref.show_id,
            file_ref.season_number,
            file_ref.episode_number,
            file_ref.file.id,
            entries.clone(),
            info.duration,
            info.size as i64,
        ))
        .await?;
    ctx.bus.publish(progress(95)).await;

    if !notes.is_empty() {
        ctx.jobs
            .update(
                store_job_id,
                JobPatch {
                    processing_notes: Some(notes.join("; ")),
                    ..Default::default()
                },
            )
            .await?;
    }

    ctx.bus.publish(progress(100)).await;
    info!(
        store_job_id,
        episode_file_id,
        windows = entries.len(),
        skipped,
        "episode fingerprinted"
    );

    Ok(ExtractionSummary {
        show_id: file_ref.show_id,
        season_number: file_ref.season_number,
        episode_file_id: file_ref.file.id,
        windows: entries.len(),
        skipped,
        duration: info.duration,
    })
}

/// Resolve an episode file or report a guard breach.
pub(crate) async fn load_file_ref(
    ctx: &Arc<WorkerContext>,
    episode_file_id: i64,
) -> WorkerResult<EpisodeFileRef> {
    ctx.catalog
        .episode_file_ref(episode_file_id)
        .await?
        .ok_or_else(|| {
            WorkerError::guard_breach(format!("episode file {episode_file_id} has no catalog row"))
        })
}

pub(crate) async fn probe_episode(file_ref: &EpisodeFileRef) -> WorkerResult<MediaInfo> {
    let info = probe_media(&file_ref.file.path).await?;
    if info.duration <= 0.0 {
        return Err(WorkerError::processing_failed(format!(
            "probe reported no duration for {}",
            file_ref.file.path
        )));
    }
    Ok(info)
}

/// Decode the audio track to the shared audio dir, holding the global decode
/// budget for the duration. Returns the decoded wav path.
pub(crate) async fn decode_stage(
    ctx: &Arc<WorkerContext>,
    file_ref: &EpisodeFileRef,
    duration: f64,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<PathBuf> {
    let audio_dir = ctx.config.temp_dir.join("audio");
    tokio::fs::create_dir_all(&audio_dir).await?;
    let wav_path = audio_dir.join(wav_name(file_ref));

    let permit = ctx.semaphore.acquire(Some(cancel_rx.clone())).await?;

    ctx.bus
        .publish(BusMessage::audio_extraction_progress(
            file_ref.file.id,
            &file_ref.file.path,
            0.0,
            "decoding",
        ))
        .await;

    let decode_result = decode_to_wav(ctx, file_ref, &wav_path, duration, cancel_rx).await;
    ctx.semaphore.release(permit).await?;
    decode_result?;

    ctx.bus
        .publish(BusMessage::audio_extraction_progress(
            file_ref.file.id,
            &file_ref.file.path,
            100.0,
            "decoded",
        ))
        .await;

    Ok(wav_path)
}

/// Walk the decoded audio window by window and fingerprint each chunk.
/// Failed chunks are skipped, not fatal; returns (entries, skipped, total).
pub(crate) async fn fingerprint_windows(
    ctx: &Arc<WorkerContext>,
    wav_path: &Path,
    run_dir: &Path,
    duration: f64,
    cancel_rx: watch::Receiver<bool>,
    progress: Option<&(dyn Fn(u8) -> BusMessage + Send + Sync)>,
) -> WorkerResult<(Vec<FingerprintEntry>, usize, usize)> {
    let offsets = chunk_offsets(duration);
    let total = offsets.len();
    let mut entries = Vec::with_capacity(total);
    let mut skipped = 0usize;

    for (i, offset) in offsets.iter().enumerate() {
        if *cancel_rx.borrow() {
            return Err(cliprr_media::MediaError::Canceled.into());
        }

        let chunk_path = run_dir.join(format!(
            "chunk_{}_{}.wav",
            *offset as i64,
            Utc::now().timestamp_millis()
        ));

        let fp = match extract_chunk(wav_path, &chunk_path, *offset).await {
            Ok(()) => fingerprint_chunk(&chunk_path).await,
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&chunk_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(chunk = %chunk_path.display(), "failed to remove chunk: {e}");
            }
        }

        match fp {
            Ok(result) => entries.push(FingerprintEntry {
                offset_seconds: *offset,
                fingerprint: result.fingerprint,
            }),
            Err(e) => {
                debug!(offset, "chunk skipped: {e}");
                skipped += 1;
            }
        }

        if let Some(progress) = progress {
            let pct = 50 + ((i + 1) * 45 / total.max(1)) as u8;
            ctx.bus.publish(progress(pct)).await;
        }
    }

    Ok((entries, skipped, total))
}

async fn decode_to_wav(
    ctx: &Arc<WorkerContext>,
    file_ref: &EpisodeFileRef,
    wav_path: &Path,
    duration: f64,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let bus_file_id = file_ref.file.id;
    let bus_path = file_ref.file.path.clone();

    // Decode progress arrives on the tool's stderr task; forward it over a
    // channel so bus publishing stays async.
    let (pct_tx, mut pct_rx) = tokio::sync::mpsc::unbounded_channel::<f64>();

    let ctx_bus = Arc::clone(ctx);
    let forward = tokio::spawn(async move {
        while let Some(pct) = pct_rx.recv().await {
            ctx_bus
                .bus
                .publish(BusMessage::audio_extraction_progress(
                    bus_file_id,
                    &bus_path,
                    pct,
                    "decoding",
                ))
                .await;
        }
    });

    let result = decode_filtered_audio(
        &file_ref.file.path,
        wav_path,
        duration,
        Some(cancel_rx),
        move |pct| {
            let _ = pct_tx.send(pct);
        },
    )
    .await;

    forward.abort();
    result.map_err(Into::into)
}

/// The decoded audio file name: `<basename>.wav` under the shared audio dir.
pub(crate) fn wav_name(file_ref: &EpisodeFileRef) -> PathBuf {
    let basename = Path::new(&file_ref.file.path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("file-{}", file_ref.file.id));
    PathBuf::from(format!("{basename}.wav"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliprr_models::EpisodeFile;

    fn file_ref(path: &str) -> EpisodeFileRef {
        EpisodeFileRef {
            file: EpisodeFile {
                id: 7,
                episode_id: 1,
                path: path.to_string(),
                size: 0,
            },
            show_id: 1,
            show_title: "Show".into(),
            season_number: 1,
            episode_number: 1,
        }
    }

    #[test]
    fn wav_name_uses_basename() {
        assert_eq!(
            wav_name(&file_ref("/media/show/s01e01.mkv")),
            PathBuf::from("s01e01.wav")
        );
        assert_eq!(wav_name(&file_ref("")), PathBuf::from("file-7.wav"));
    }

    #[test]
    fn chunk_loss_threshold() {
        // 3 of 20 chunks surviving is below the 25% floor.
        let total = 20usize;
        let skipped = 17usize;
        assert!(((total - skipped) as f64 / total as f64) < MIN_CHUNK_SUCCESS_RATIO);
    }
}
