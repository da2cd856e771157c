//! Audio decode, chunking, and fingerprinting.

use std::path::Path;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::command::{ToolCommand, ToolRunner};
use crate::error::{MediaError, MediaResult};
use crate::progress::{parse_time_token, percent_of};

/// Fingerprint window length in seconds.
pub const CHUNK_WINDOW_SECONDS: f64 = 30.0;

/// Hop between window starts in seconds (20 s overlap).
pub const HOP_SECONDS: f64 = 10.0;

/// Band-limited mono downmix tuned for melody-range matching: resample,
/// average the stereo pair, cut rumble below 300 Hz and hiss above 3 kHz,
/// then lift the level for the fingerprinter.
const FILTER_CHAIN: &str =
    "aresample=44100,pan=mono|c0=0.5*c0+0.5*c1,highpass=f=300,lowpass=f=3000,volume=1.5";

/// Decode an episode's audio track to a filtered mono 44.1 kHz PCM WAV.
///
/// Falls back to a plain extraction when the filter chain fails (some files
/// carry mono or already-downmixed tracks the pan filter rejects). The output
/// is verified nonempty on both paths.
///
/// `total_duration` is the probed media duration used to convert the
/// decoder's `time=` stats into a percentage for `on_progress`.
pub async fn decode_filtered_audio<F>(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    total_duration: f64,
    cancel_rx: Option<watch::Receiver<bool>>,
    on_progress: F,
) -> MediaResult<()>
where
    F: Fn(f64) + Send + Sync + Clone + 'static,
{
    let input = input.as_ref();
    let output = output.as_ref();

    let mut runner = ToolRunner::new();
    if let Some(rx) = cancel_rx.clone() {
        runner = runner.with_cancel(rx);
    }

    let filtered = ToolCommand::new("ffmpeg")
        .args(["-y", "-v", "error", "-stats"])
        .args(["-i", &input.to_string_lossy().into_owned()])
        .args(["-vn", "-acodec", "pcm_s16le", "-ar", "44100"])
        .args(["-af", FILTER_CHAIN])
        .arg(output.to_string_lossy().into_owned())
        .expect_output(output);

    let progress = on_progress.clone();
    let result = runner
        .spawn_streaming(&filtered, move |line| {
            if let Some(elapsed) = parse_time_token(line) {
                progress(percent_of(elapsed, total_duration));
            }
        })
        .await;

    match result {
        Ok(_) => {}
        Err(e) if e.is_cancellation() => return Err(e),
        Err(e) => {
            warn!(
                input = %input.display(),
                error = %e,
                "filtered decode failed, retrying with plain extraction"
            );
            let _ = tokio::fs::remove_file(output).await;

            let mut runner = ToolRunner::new();
            if let Some(rx) = cancel_rx {
                runner = runner.with_cancel(rx);
            }
            let plain = ToolCommand::new("ffmpeg")
                .args(["-y", "-v", "error", "-stats"])
                .args(["-i", &input.to_string_lossy().into_owned()])
                .args(["-vn", "-acodec", "pcm_s16le", "-ar", "44100", "-ac", "1"])
                .arg(output.to_string_lossy().into_owned())
                .expect_output(output);

            let progress = on_progress.clone();
            runner
                .spawn_streaming(&plain, move |line| {
                    if let Some(elapsed) = parse_time_token(line) {
                        progress(percent_of(elapsed, total_duration));
                    }
                })
                .await?;
        }
    }

    let meta = tokio::fs::metadata(output).await;
    match meta {
        Ok(m) if m.len() > 0 => Ok(()),
        _ => Err(MediaError::EmptyOutput(output.to_path_buf())),
    }
}

/// Window start offsets walking `[0, duration)` with the canonical hop.
pub fn chunk_offsets(duration: f64) -> Vec<f64> {
    let mut offsets = Vec::new();
    if duration <= 0.0 {
        return offsets;
    }
    let mut t = 0.0;
    while t < duration {
        offsets.push(t);
        t += HOP_SECONDS;
    }
    offsets
}

/// Extract one window `[offset, offset + CHUNK_WINDOW_SECONDS]` from a
/// decoded WAV into `chunk_path`.
pub async fn extract_chunk(
    decoded_wav: impl AsRef<Path>,
    chunk_path: impl AsRef<Path>,
    offset: f64,
) -> MediaResult<()> {
    let chunk_path = chunk_path.as_ref();

    let cmd = ToolCommand::new("ffmpeg")
        .args(["-y", "-v", "error"])
        .args(["-ss", &format!("{offset:.3}")])
        .args(["-t", &format!("{CHUNK_WINDOW_SECONDS:.3}")])
        .args(["-i", &decoded_wav.as_ref().to_string_lossy().into_owned()])
        .args(["-acodec", "copy"])
        .arg(chunk_path.to_string_lossy().into_owned())
        .expect_output(chunk_path);

    ToolRunner::new().run(&cmd).await?;

    let meta = tokio::fs::metadata(chunk_path).await;
    match meta {
        Ok(m) if m.len() > 0 => Ok(()),
        _ => Err(MediaError::EmptyOutput(chunk_path.to_path_buf())),
    }
}

/// Parsed `fpcalc -json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct FpcalcResult {
    pub duration: f64,
    pub fingerprint: String,
}

/// Fingerprint one chunk file with the chromaprint CLI.
pub async fn fingerprint_chunk(chunk_path: impl AsRef<Path>) -> MediaResult<FpcalcResult> {
    let chunk_path = chunk_path.as_ref();

    let cmd = ToolCommand::new("fpcalc")
        .arg("-json")
        .arg(chunk_path.to_string_lossy().into_owned());

    let out = ToolRunner::new().run(&cmd).await?;
    let parsed: FpcalcResult = serde_json::from_str(&out.stdout)?;

    if parsed.fingerprint.is_empty() {
        return Err(MediaError::tool_failed(
            "fpcalc",
            "empty fingerprint",
            None,
            Some(out.exit_code),
        ));
    }

    debug!(
        chunk = %chunk_path.display(),
        fp_len = parsed.fingerprint.len(),
        "fingerprinted chunk"
    );

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_walk_with_ten_second_hop() {
        let offsets = chunk_offsets(35.0);
        assert_eq!(offsets, vec![0.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn empty_duration_yields_no_offsets() {
        assert!(chunk_offsets(0.0).is_empty());
        assert!(chunk_offsets(-5.0).is_empty());
    }

    #[test]
    fn long_file_offset_count() {
        // 1800 s with a 10 s hop: offsets 0, 10, ..., 1790.
        assert_eq!(chunk_offsets(1800.0).len(), 180);
    }

    #[test]
    fn fpcalc_json_parses() {
        let json = r#"{"duration": 30.02, "fingerprint": "AQAAf0mSJEuSJEmS"}"#;
        let parsed: FpcalcResult = serde_json::from_str(json).unwrap();
        assert!((parsed.duration - 30.02).abs() < 1e-9);
        assert_eq!(parsed.fingerprint, "AQAAf0mSJEuSJEmS");
    }
}
