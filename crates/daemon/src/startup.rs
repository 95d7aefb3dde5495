//! Startup checks module for Clip Relay
//!
//! Preflight checks run before the daemon starts watching:
//! - ffmpeg and ffprobe can be executed
//! - ffmpeg was built with the libx264 encoder

use clip_relay_config::EncoderConfig;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::info;

/// Encoder every trial uses
const REQUIRED_ENCODER: &str = "libx264";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("ffmpeg lacks the {0} encoder")]
    MissingEncoder(String),
}

/// Versions reported by the external tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub ffmpeg: String,
    pub ffprobe: String,
}

/// Parse the version token from `<tool> -version` output
///
/// Handles release versions ("ffmpeg version 7.1 ..."), n-prefixed git
/// builds ("ffmpeg version n7.0-...") and date-stamped snapshots
/// ("ffmpeg version 2024-05-01-git-...").
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let lower = version_line.to_lowercase();
    let start = lower.find(&marker)? + marker.len();
    let token = version_line[start..].split_whitespace().next()?;
    Some(token.to_string())
}

/// Major version number from a version token such as `n7.0-12-g3f` or `6.1.1`
pub fn major_version(token: &str) -> Option<u32> {
    token
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?
        .parse()
        .ok()
}

fn tool_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Run `<tool> -version` and return its version token
pub fn check_tool_available(path: &Path) -> Result<String, StartupError> {
    let tool = tool_name(path);
    let output = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.clone(),
            reason: format!(
                "failed to run {} -version; is it installed and in PATH? Error: {}",
                path.display(),
                e
            ),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.clone(),
            reason: format!("{} -version exited with {}", path.display(), output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_tool_version(&stdout, &tool).ok_or_else(|| StartupError::ToolUnavailable {
        tool,
        reason: format!(
            "could not parse version from output: {}",
            stdout.lines().next().unwrap_or("(empty)")
        ),
    })
}

/// Whether `ffmpeg -encoders` output lists `encoder`
pub fn encoders_include(encoders_output: &str, encoder: &str) -> bool {
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

/// Verify ffmpeg can encode H.264 with libx264
pub fn check_libx264(ffmpeg: &Path) -> Result<(), StartupError> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool_name(ffmpeg),
            reason: e.to_string(),
        })?;

    let listing = String::from_utf8_lossy(&output.stdout);
    if encoders_include(&listing, REQUIRED_ENCODER) {
        Ok(())
    } else {
        Err(StartupError::MissingEncoder(REQUIRED_ENCODER.to_string()))
    }
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
/// 3. libx264 support
pub fn run_startup_checks(cfg: &EncoderConfig) -> Result<ToolVersions, StartupError> {
    let ffmpeg = check_tool_available(&cfg.ffmpeg)?;
    let ffprobe = check_tool_available(&cfg.ffprobe)?;
    check_libx264(&cfg.ffmpeg)?;

    info!(ffmpeg = %ffmpeg, ffprobe = %ffprobe, "encoder tools available");
    Ok(ToolVersions { ffmpeg, ffprobe })
}
