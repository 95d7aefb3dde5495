//! Worker for Clip Relay
//!
//! Takes one task at a time off the ingest queue and runs it through the
//! pipeline: probe, trim to the trailing seconds, size search, upload.

use crate::abort::AbortSignal;
use crate::delivery::{ClipDelivery, DeliverySink};
use crate::encode::{thread_cap, EncodeError, EncodeParams, EncoderGateway, ProbeError};
use crate::queue::{IngestQueue, ProcessingTask, TaskState};
use crate::replace::{safe_remove, RetryPolicy};
use crate::search::{SearchError, SearchOutcome, SearchRequest, SizeSearch};
use crate::status::SharedStatus;
use chrono::{DateTime, Local};
use clip_relay_config::{CompressionConfig, Config};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Smallest intermediate clip accepted as a real extract (100 KiB)
pub const MIN_INTERMEDIATE_BYTES: u64 = 100 * 1024;

/// Category used when a recording sits directly in a filesystem root
const FALLBACK_CATEGORY: &str = "clips";

/// Default wait for new work before re-checking the abort flag
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Error type for task processing
#[derive(Debug, Error)]
pub enum TaskError {
    /// Source could not be probed
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// High-quality extract failed
    #[error("Extract failed: {0}")]
    Extract(EncodeError),

    /// Extract produced a file too small to be a real clip
    #[error("Intermediate clip {path} is only {size} bytes")]
    IntermediateTooSmall { path: PathBuf, size: u64 },

    /// Size search failed
    #[error("Size search failed: {0}")]
    Search(SearchError),

    /// Abort was requested
    #[error("Task aborted")]
    Aborted,

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SearchError> for TaskError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Aborted => TaskError::Aborted,
            other => TaskError::Search(other),
        }
    }
}

/// Outcome of one task, produced for every dequeued task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    pub source_path: PathBuf,
    pub state: TaskState,
    pub final_path: Option<PathBuf>,
    pub size_mb: Option<f64>,
    /// Seconds from detection to the end of processing
    pub elapsed_secs: f64,
    pub uploaded: bool,
}

/// Names derived from a source recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    /// Name of the folder holding the recording, usually the game
    pub category: String,
    /// `{category}-{MMDDYYYY-HHMM}.mp4`
    pub final_name: String,
}

impl OutputNames {
    pub fn for_source(source: &Path, now: DateTime<Local>) -> Self {
        let category = source
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_CATEGORY.to_string());
        let final_name = format!("{}-{}.mp4", category, now.format("%m%d%Y-%H%M"));
        Self {
            category,
            final_name,
        }
    }

    pub fn intermediate_name(&self) -> String {
        format!("temp_{}", self.final_name)
    }
}

/// Where to start the extract so only the trailing `clip_secs` remain
pub fn trim_start(duration_secs: f64, clip_secs: f64) -> f64 {
    if duration_secs > clip_secs {
        duration_secs - clip_secs
    } else {
        0.0
    }
}

struct Processed {
    outcome: SearchOutcome,
    uploaded: bool,
}

/// Single consumer of the ingest queue
pub struct Worker {
    compression: CompressionConfig,
    output_dir: PathBuf,
    gateway: Arc<dyn EncoderGateway>,
    sink: Arc<dyn DeliverySink>,
    queue: Arc<IngestQueue>,
    status: SharedStatus,
    abort: AbortSignal,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        config: &Config,
        gateway: Arc<dyn EncoderGateway>,
        sink: Arc<dyn DeliverySink>,
        queue: Arc<IngestQueue>,
        status: SharedStatus,
        abort: AbortSignal,
    ) -> Self {
        Self {
            compression: config.compression.clone(),
            output_dir: config.output_folder(),
            gateway,
            sink,
            queue,
            status,
            abort,
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process tasks in FIFO order until abort is requested
    pub async fn run(self) {
        info!(output = %self.output_dir.display(), "worker started");
        while !self.abort.is_triggered() {
            let Some(task) = self.queue.pop(self.poll_interval).await else {
                continue;
            };
            self.process(task).await;
        }
        info!("worker stopped");
    }

    /// Run one task to a terminal state, recording it in the status snapshot
    pub async fn process(&self, task: ProcessingTask) -> TaskReport {
        let source = task.source_path.clone();
        info!(task_id = %task.id, source = %source.display(), "processing clip");
        {
            let queue_len = self.queue.len().await;
            let mut status = self.status.write().await;
            status.processing = Some(source.clone());
            status.queue_len = queue_len;
            status.touch();
        }

        let result = self.execute(&task).await;
        let elapsed = self.queue.finish(&source).await.unwrap_or_default();

        let mut report = TaskReport {
            task_id: task.id.clone(),
            source_path: source.clone(),
            state: TaskState::Completed,
            final_path: None,
            size_mb: None,
            elapsed_secs: elapsed.as_secs_f64(),
            uploaded: false,
        };

        match result {
            Ok(done) => {
                info!(
                    task_id = %task.id,
                    output = %done.outcome.final_path.display(),
                    size_mb = %format!("{:.2}", done.outcome.size_mb),
                    elapsed_secs = report.elapsed_secs,
                    uploaded = done.uploaded,
                    "clip finished"
                );
                report.final_path = Some(done.outcome.final_path);
                report.size_mb = Some(done.outcome.size_mb);
                report.uploaded = done.uploaded;
            }
            Err(TaskError::Aborted) => {
                warn!(task_id = %task.id, source = %source.display(), "clip aborted");
                report.state = TaskState::Aborted;
            }
            Err(e) => {
                error!(task_id = %task.id, source = %source.display(), error = %e, "clip failed");
                report.state = TaskState::Failed(e.to_string());
            }
        }

        let queue_len = self.queue.len().await;
        let mut status = self.status.write().await;
        status.queue_len = queue_len;
        status.record(report.clone());
        report
    }

    async fn execute(&self, task: &ProcessingTask) -> Result<Processed, TaskError> {
        self.check_abort()?;

        let clip = self.gateway.probe(&task.source_path).await?;
        let names = OutputNames::for_source(&task.source_path, Local::now());
        let start = trim_start(clip.duration_secs, self.compression.clip_duration_secs);
        debug!(
            duration_secs = clip.duration_secs,
            width = clip.width,
            height = clip.height,
            bitrate_kbps = clip.bitrate_kbps,
            start_secs = start,
            "probed source"
        );

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let intermediate = self.output_dir.join(names.intermediate_name());

        let outcome = match self.compress(task, &names, start, &intermediate).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = safe_remove(&intermediate, self.retry).await {
                    warn!(error = %cleanup, "intermediate clip left behind");
                }
                return Err(e);
            }
        };

        self.check_abort()?;
        let uploaded = self.deliver(task, &names, &outcome).await;

        Ok(Processed { outcome, uploaded })
    }

    async fn compress(
        &self,
        task: &ProcessingTask,
        names: &OutputNames,
        start: f64,
        intermediate: &Path,
    ) -> Result<SearchOutcome, TaskError> {
        let cfg = &self.compression;
        let params = EncodeParams::new(
            cfg.extract_quality,
            cfg.extract_preset.clone(),
            thread_cap(cfg.threads),
        );

        info!(start_secs = start, quality = cfg.extract_quality, "extracting clip");
        self.gateway
            .extract_range(&task.source_path, start, intermediate, &params, &self.abort)
            .await
            .map_err(|e| match e {
                EncodeError::Aborted => TaskError::Aborted,
                other => TaskError::Extract(other),
            })?;
        self.check_abort()?;

        let size = tokio::fs::metadata(intermediate).await?.len();
        if size < MIN_INTERMEDIATE_BYTES {
            return Err(TaskError::IntermediateTooSmall {
                path: intermediate.to_path_buf(),
                size,
            });
        }

        let request = SearchRequest {
            intermediate,
            source: &task.source_path,
            trim_start_secs: start,
            output_dir: &self.output_dir,
            final_name: &names.final_name,
        };
        let outcome = SizeSearch::new(self.gateway.as_ref(), cfg, &self.abort)
            .with_retry_policy(self.retry)
            .run(&request)
            .await?;
        Ok(outcome)
    }

    /// Upload the clip; failures are logged and leave the task completed
    async fn deliver(
        &self,
        task: &ProcessingTask,
        names: &OutputNames,
        outcome: &SearchOutcome,
    ) -> bool {
        let elapsed = self
            .queue
            .elapsed(&task.source_path)
            .await
            .unwrap_or_default();
        let clip = ClipDelivery {
            artifact: outcome.final_path.clone(),
            display_name: self.compression.display_name.clone(),
            category: names.category.clone(),
            size_mb: outcome.size_mb,
            elapsed,
        };

        match self.sink.upload(&clip).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    output = %outcome.final_path.display(),
                    error = %e,
                    "upload failed, clip kept locally"
                );
                false
            }
        }
    }

    fn check_abort(&self) -> Result<(), TaskError> {
        if self.abort.is_triggered() {
            Err(TaskError::Aborted)
        } else {
            Ok(())
        }
    }
}
