//! Media inspection via ffprobe.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::{ToolCommand, ToolRunner};
use crate::error::{MediaError, MediaResult};

/// Duration below which an episode is flagged as suspiciously short.
const SHORT_DURATION_SECONDS: f64 = 300.0;

/// Bytes-per-second below which a file is flagged as low bitrate.
const LOW_BITRATE_BYTES_PER_SEC: f64 = 100_000.0;

/// Probed media information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds
    pub duration: f64,
    /// File size in bytes
    pub size: u64,
}

impl MediaInfo {
    /// Advisory indicators recorded in processing notes. Diagnostic only;
    /// detection is never gated on them.
    pub fn advisories(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.duration < SHORT_DURATION_SECONDS {
            out.push("short_duration");
        }
        if self.duration > 0.0 && (self.size as f64 / self.duration) < LOW_BITRATE_BYTES_PER_SEC {
            out.push("low_bitrate");
        }
        out
    }
}

/// ffprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

/// Probe a media file for duration and size.
pub async fn probe_media(path: impl AsRef<Path>) -> MediaResult<MediaInfo> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let cmd = ToolCommand::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path.to_string_lossy().into_owned());

    let out = ToolRunner::new().run(&cmd).await.map_err(|e| match e {
        MediaError::ToolFailed {
            message,
            stderr_tail,
            ..
        } => MediaError::ProbeFailed {
            message,
            stderr_tail,
        },
        other => other,
    })?;

    let probe: FfprobeOutput = serde_json::from_str(&out.stdout)?;

    let duration = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    // ffprobe's size can be missing for some containers; fall back to stat.
    let size = match probe.format.size.as_deref().and_then(|s| s.parse::<u64>().ok()) {
        Some(s) => s,
        None => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
    };

    Ok(MediaInfo { duration, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_quiet_files_are_flagged() {
        let info = MediaInfo {
            duration: 120.0,
            size: 1_000_000,
        };
        let adv = info.advisories();
        assert!(adv.contains(&"short_duration"));
        assert!(adv.contains(&"low_bitrate"));
    }

    #[test]
    fn healthy_file_has_no_advisories() {
        let info = MediaInfo {
            duration: 1800.0,
            size: 900_000_000,
        };
        assert!(info.advisories().is_empty());
    }

    #[test]
    fn zero_duration_does_not_divide() {
        let info = MediaInfo {
            duration: 0.0,
            size: 0,
        };
        assert_eq!(info.advisories(), vec!["short_duration"]);
    }
}
