//! ffmpeg/ffprobe implementation of the encoder gateway
//!
//! Builds the H.264/AAC command lines, runs them as child processes that can be
//! killed on abort or timeout, and parses ffprobe JSON.

use super::{EncodeError, EncodeParams, EncoderGateway, ProbeError, SourceClip};
use crate::abort::AbortSignal;
use async_trait::async_trait;
use clip_relay_config::EncoderConfig;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Video codec passed to ffmpeg
const VIDEO_CODEC: &str = "libx264";

/// Audio codec passed to ffmpeg
const AUDIO_CODEC: &str = "aac";

/// How often a running encoder is checked for abort and timeout
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Windows `CREATE_NO_WINDOW` process creation flag
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Encoder gateway backed by the ffmpeg and ffprobe executables
#[derive(Debug, Clone)]
pub struct FfmpegGateway {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    hide_window: bool,
    timeout: Duration,
    poll_interval: Duration,
}

impl FfmpegGateway {
    pub fn new(cfg: &EncoderConfig) -> Self {
        Self {
            ffmpeg: cfg.ffmpeg.clone(),
            ffprobe: cfg.ffprobe.clone(),
            hide_window: cfg.hide_window,
            timeout: Duration::from_secs(cfg.timeout_secs),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override how often abort and timeout are checked while a child runs
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn an encoder command and wait for it, killing it on abort or timeout.
    ///
    /// Any partial output is removed when the encode does not succeed.
    async fn run_encoder(
        &self,
        mut cmd: Command,
        output: &Path,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        apply_hide_window(&mut cmd, self.hide_window);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        debug!(command = ?cmd.as_std(), "spawning encoder");
        let mut child = cmd.spawn()?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = tokio::time::sleep(self.poll_interval) => {
                    if abort.is_triggered() {
                        let _ = child.kill().await;
                        remove_partial(output);
                        return Err(EncodeError::Aborted);
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            timeout = ?self.timeout,
                            output = %output.display(),
                            "encoder timed out, killing it"
                        );
                        let _ = child.kill().await;
                        remove_partial(output);
                        return Err(EncodeError::TimedOut(self.timeout));
                    }
                }
            }
        };

        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            remove_partial(output);
            return match status.code() {
                Some(code) => Err(EncodeError::Failed {
                    code,
                    stderr: stderr.trim().to_string(),
                }),
                None => Err(EncodeError::Terminated),
            };
        }

        verify_output(output)
    }
}

#[async_trait]
impl EncoderGateway for FfmpegGateway {
    async fn probe(&self, path: &Path) -> Result<SourceClip, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null());
        apply_hide_window(&mut cmd, self.hide_window);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ProbeError::FfprobeFailed(format!("timed out after {:?}", self.timeout))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(path, &stdout)
    }

    async fn extract_range(
        &self,
        input: &Path,
        start_secs: f64,
        output: &Path,
        params: &EncodeParams,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        let cmd = build_encode_command(&self.ffmpeg, input, Some(start_secs), output, params);
        self.run_encoder(cmd, output, abort).await
    }

    async fn transcode_whole(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParams,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        let cmd = build_encode_command(&self.ffmpeg, input, None, output, params);
        self.run_encoder(cmd, output, abort).await
    }
}

/// Build an ffmpeg command re-encoding `input` into `output`
///
/// The argument contract matches the recorder clips' original pipeline:
/// `-ss` as an input option when trimming, then `-vcodec libx264 -acodec aac
/// -crf <q> -preset <p>`, optional `-threads`, and `-y` to overwrite.
pub fn build_encode_command(
    ffmpeg: &Path,
    input: &Path,
    start_secs: Option<f64>,
    output: &Path,
    params: &EncodeParams,
) -> Command {
    let mut cmd = Command::new(ffmpeg);

    cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);

    if let Some(start) = start_secs {
        cmd.arg("-ss").arg(format_seconds(start));
    }
    cmd.arg("-i").arg(input);

    cmd.arg("-vcodec").arg(VIDEO_CODEC);
    cmd.arg("-acodec").arg(AUDIO_CODEC);
    cmd.arg("-crf").arg(params.quality.to_string());
    cmd.arg("-preset").arg(&params.preset);

    if let Some(threads) = params.threads {
        cmd.arg("-threads").arg(threads.to_string());
    }

    cmd.arg("-y").arg(output);
    cmd
}

/// Seconds as ffmpeg accepts them, millisecond precision
fn format_seconds(secs: f64) -> String {
    format!("{:.3}", secs.max(0.0))
}

#[cfg(windows)]
fn apply_hide_window(cmd: &mut Command, hide: bool) {
    use std::os::windows::process::CommandExt;
    if hide {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
}

#[cfg(not(windows))]
fn apply_hide_window(_cmd: &mut Command, _hide: bool) {}

fn remove_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            warn!(path = %output.display(), error = %e, "failed to remove partial encoder output");
        }
    }
}

fn verify_output(output: &Path) -> Result<(), EncodeError> {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => {
            remove_partial(output);
            Err(EncodeError::MissingOutput(output.to_path_buf()))
        }
        Err(_) => Err(EncodeError::MissingOutput(output.to_path_buf())),
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Parses ffprobe JSON output into a SourceClip.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<SourceClip, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| ProbeError::ParseError("Missing or invalid duration".to_string()))?;

    let bitrate_kbps = format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<f64>().ok())
        .map(|bps| bps / 1000.0)
        .unwrap_or(0.0);

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;

    Ok(SourceClip {
        path: path.to_path_buf(),
        duration_secs,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        bitrate_kbps,
    })
}
