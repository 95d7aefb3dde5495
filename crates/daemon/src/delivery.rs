//! Delivery of finished clips to a chat webhook.

use async_trait::async_trait;
use clip_relay_config::WebhookConfig;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Mime type of every uploaded clip
const CLIP_MIME: &str = "video/mp4";

/// Errors that can occur while uploading a clip
#[derive(Debug, Error)]
pub enum UploadError {
    /// The endpoint answered with something other than 200/204
    #[error("Webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The request could not be sent
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The clip could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the sink needs to announce one clip
#[derive(Debug, Clone, PartialEq)]
pub struct ClipDelivery {
    pub artifact: PathBuf,
    pub display_name: Option<String>,
    /// Source folder name, usually the game
    pub category: String,
    pub size_mb: f64,
    pub elapsed: Duration,
}

impl ClipDelivery {
    /// Human readable message sent along with the file
    pub fn caption(&self) -> String {
        let body = format!(
            "new clip from {} ({:.2} MB, processed in {})",
            self.category,
            self.size_mb,
            format_elapsed(self.elapsed)
        );
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{}: {}", name, body),
            _ => body,
        }
    }
}

/// Destination for finished clips
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// One delivery attempt; no retries
    async fn upload(&self, clip: &ClipDelivery) -> Result<(), UploadError>;
}

/// Multipart POST to a Discord-style webhook
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(cfg: &WebhookConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: cfg.url.clone(),
        })
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn upload(&self, clip: &ClipDelivery) -> Result<(), UploadError> {
        let bytes = tokio::fs::read(&clip.artifact).await?;
        let file_name = artifact_name(&clip.artifact);

        let file_part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(CLIP_MIME)?;

        let form = reqwest::multipart::Form::new()
            .text("content", clip.caption())
            .part("file", file_part);

        let response = self.client.post(&self.url).multipart(form).send().await?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            info!(file = %file_name, status = status.as_u16(), "clip delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            file = %file_name,
            status = status.as_u16(),
            body = %body,
            "webhook rejected clip"
        );
        Err(UploadError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn artifact_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip.mp4".to_string())
}

/// Render a duration as `42s`, `3m 07s` or `1h 02m 03s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
