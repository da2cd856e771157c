//! External tool plumbing for the cliprr pipeline.
//!
//! This crate wraps the three binaries the pipeline shells out to:
//! - type-safe command building and bounded-output capture,
//! - `time=` progress parsing from the decoder's stats channel,
//! - cancellation and timeouts via tokio,
//! - ffprobe media inspection,
//! - the audio decode / chunk / fingerprint operations.

pub mod audio;
pub mod command;
pub mod error;
pub mod probe;
pub mod progress;

pub use audio::{
    chunk_offsets, decode_filtered_audio, extract_chunk, fingerprint_chunk, FpcalcResult,
    CHUNK_WINDOW_SECONDS, HOP_SECONDS,
};
pub use command::{check_tools, ToolCommand, ToolOutput, ToolRunner, STDERR_TAIL_LINES};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_media, MediaInfo};
pub use progress::{parse_time_token, percent_of};
