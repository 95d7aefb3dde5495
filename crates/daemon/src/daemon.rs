//! Daemon startup and shutdown for Clip Relay
//!
//! Wires the watcher, ingest loop, worker and optional status server
//! together and owns their task handles.

use crate::abort::AbortSignal;
use crate::config::{Config, ConfigError};
use crate::delivery::{DeliverySink, UploadError, WebhookSink};
use crate::encode::{EncoderGateway, FfmpegGateway};
use crate::queue::IngestQueue;
use crate::startup::{run_startup_checks, StartupError};
use crate::status::{new_shared_status, SharedStatus};
use crate::status_server::{bind_status_listener, serve_status, ServerError};
use crate::watch::{run_ingest, PollingWatcher, SettlePolicy};
use crate::worker::Worker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for the worker to finish its current task
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Capacity of the watcher to ingest channel
const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Watch folder not found: {}", .0.display())]
    FolderNotFound(PathBuf),

    #[error("Daemon is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Webhook client error: {0}")]
    Webhook(#[from] UploadError),
}

/// Whether `start` runs the encoder preflight checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupChecks {
    #[default]
    Run,
    Skip,
}

/// Handles of the tasks spawned by one `start`
struct RunningTasks {
    worker: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

/// Process-level controller: one watcher, one worker, at most one run at a time
pub struct Daemon {
    queue: Arc<IngestQueue>,
    status: SharedStatus,
    abort: AbortSignal,
    running: Mutex<Option<RunningTasks>>,
    grace_period: Duration,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(IngestQueue::new()),
            status: new_shared_status(),
            abort: AbortSignal::new(),
            running: Mutex::new(None),
            grace_period: STOP_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Shared status snapshot, also served by the status endpoint
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn queue(&self) -> Arc<IngestQueue> {
        self.queue.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start watching with the real ffmpeg gateway and webhook sink
    ///
    /// Startup sequence:
    /// 1. Validate config
    /// 2. Check the watch folder exists and create the output folder
    /// 3. Run encoder preflight checks (unless skipped)
    /// 4. Spawn watcher, ingest loop, worker and status server
    pub async fn start(&self, config: Config, checks: StartupChecks) -> Result<(), DaemonError> {
        config.validate()?;
        if checks == StartupChecks::Run {
            run_startup_checks(&config.encoder)?;
        }

        let gateway: Arc<dyn EncoderGateway> = Arc::new(FfmpegGateway::new(&config.encoder));
        let sink: Arc<dyn DeliverySink> = Arc::new(WebhookSink::new(&config.webhook)?);
        self.start_with(config, gateway, sink).await
    }

    /// Start with an explicit gateway and sink
    pub async fn start_with(
        &self,
        config: Config,
        gateway: Arc<dyn EncoderGateway>,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<(), DaemonError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        config.validate()?;
        let watch_dir = &config.folders.watch;
        if !watch_dir.is_dir() {
            return Err(DaemonError::FolderNotFound(watch_dir.clone()));
        }
        let output_dir = config.output_folder();
        tokio::fs::create_dir_all(&output_dir).await?;

        let listener = match config.status.bind.as_deref() {
            Some(addr) => Some(bind_status_listener(addr).await?),
            None => None,
        };

        self.abort.reset();

        let watcher = PollingWatcher::new(watch_dir, &output_dir, &config.watch);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut background = vec![
            tokio::spawn(watcher.run(tx, self.abort.clone())),
            tokio::spawn(run_ingest(
                rx,
                self.queue.clone(),
                SettlePolicy::from(&config.watch),
                self.abort.clone(),
            )),
        ];

        if let Some(listener) = listener {
            let status = self.status.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = serve_status(listener, status).await {
                    error!(error = %e, "status server stopped");
                }
            }));
        }

        let worker = Worker::new(
            &config,
            gateway,
            sink,
            self.queue.clone(),
            self.status.clone(),
            self.abort.clone(),
        );
        let worker = tokio::spawn(worker.run());

        {
            let mut status = self.status.write().await;
            status.running = true;
            status.touch();
        }

        info!(
            watch = %watch_dir.display(),
            output = %output_dir.display(),
            method = ?config.compression.method,
            "daemon started"
        );
        *running = Some(RunningTasks { worker, background });
        Ok(())
    }

    /// Stop all tasks; calling it on a stopped daemon does nothing
    ///
    /// Pending tasks are dropped. The clip being processed sees the abort
    /// flag, its encoder child is killed and its temp files are removed.
    pub async fn stop(&self) {
        let Some(tasks) = self.running.lock().await.take() else {
            return;
        };

        info!("stopping daemon");
        self.abort.trigger();
        let dropped = self.queue.drain().await;
        if dropped > 0 {
            info!(dropped, "pending clips dropped");
        }

        let RunningTasks { worker, background } = tasks;
        let worker_abort = worker.abort_handle();
        match tokio::time::timeout(self.grace_period, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker task ended abnormally"),
            Err(_) => {
                warn!(grace_period = ?self.grace_period, "worker did not stop in time, cancelling");
                worker_abort.abort();
            }
        }

        for handle in background {
            handle.abort();
            let _ = handle.await;
        }

        // an ingest task cut off mid-settle leaves its path tracked
        let leftover = self.queue.clear().await;
        if leftover > 0 {
            debug!(leftover, "forgot unfinished detections");
        }

        let mut status = self.status.write().await;
        status.running = false;
        status.processing = None;
        status.queue_len = 0;
        status.touch();
        info!("daemon stopped");
    }
}
