//! Encoder gateway for Clip Relay
//!
//! The rest of the crate only talks to the external encoder through the
//! [`EncoderGateway`] trait, so the size search can be driven by a fake encoder
//! in tests.

pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod fake;

pub use ffmpeg::{build_encode_command, parse_ffprobe_output, FfmpegGateway};

use crate::abort::AbortSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Bytes per mebibyte; all sizes in the crate are MiB of the real file.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Error type for probe operations
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe output could not be understood
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The container has no video stream
    #[error("No video stream in {0}")]
    NoVideoStream(PathBuf),

    /// IO error while spawning ffprobe
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder exited with non-zero status
    #[error("Encoder failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    /// Encoder was terminated by a signal
    #[error("Encoder process was terminated by signal")]
    Terminated,

    /// Encoder reported success but left no usable output
    #[error("Encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    /// Abort was requested while the encoder was running
    #[error("Encode aborted")]
    Aborted,

    /// Encoder ran past the configured limit and was killed
    #[error("Encoder timed out after {0:?}")]
    TimedOut(Duration),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Probed properties of a source recording
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceClip {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    /// Container bitrate in kbps (0 when the container does not report one)
    pub bitrate_kbps: f64,
}

/// Per-invocation encoder settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    /// CRF-style quality parameter; lower is higher fidelity
    pub quality: u32,
    /// Speed/quality preset, passed through verbatim
    pub preset: String,
    /// Encoder thread cap
    pub threads: Option<u32>,
}

impl EncodeParams {
    pub fn new(quality: u32, preset: impl Into<String>, threads: Option<u32>) -> Self {
        Self {
            quality,
            preset: preset.into(),
            threads,
        }
    }
}

/// Access to the external encoder and prober.
///
/// Implementations write exactly one file at `output` on success and leave no
/// output behind on failure.
#[async_trait]
pub trait EncoderGateway: Send + Sync {
    /// Probe duration, resolution and container bitrate
    async fn probe(&self, path: &Path) -> Result<SourceClip, ProbeError>;

    /// Re-encode `input` from `start_secs` to the end of the file
    async fn extract_range(
        &self,
        input: &Path,
        start_secs: f64,
        output: &Path,
        params: &EncodeParams,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError>;

    /// Re-encode the whole of `input`
    async fn transcode_whole(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParams,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError>;
}

/// Size of a file in MiB
pub fn file_size_mb(path: &Path) -> std::io::Result<f64> {
    Ok(std::fs::metadata(path)?.len() as f64 / BYTES_PER_MB)
}

/// Clamp a configured encoder thread cap to the cores actually available
pub fn thread_cap(requested: Option<u32>) -> Option<u32> {
    let cores = num_cpus::get().max(1) as u32;
    requested.map(|threads| threads.clamp(1, cores))
}
