//! Watch source for discovering new recordings.
//!
//! The recorder saves into the watch folder or one game folder below it. A
//! polling scanner diffs snapshots of that tree and reports files that were
//! not there before; the ingest loop settles and queues them.

use crate::abort::AbortSignal;
use crate::queue::{normalize_path, IngestQueue};
use crate::stability::{wait_until_settled, StabilityResult};
use chrono::{DateTime, Local};
use clip_relay_config::WatchConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// The watch folder itself plus one level of game folders
const SCAN_DEPTH: usize = 2;

/// A newly created recording
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub detected_at: DateTime<Local>,
}

/// A video file found during a scan.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

/// Checks if a file has one of `extensions` (without dot, case-insensitive).
pub fn is_video_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Scan `root` and its immediate subfolders for video files.
///
/// Hidden directories and the `exclude` directory (the output folder) are
/// skipped.
pub fn scan_folder(root: &Path, exclude: Option<&Path>, extensions: &[String]) -> Vec<ScanEntry> {
    if !root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(root)
        .max_depth(SCAN_DEPTH)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            let excluded = exclude
                .map(|dir| entry.path() == dir || normalize_path(entry.path()) == dir)
                .unwrap_or(false);
            !hidden && !excluded
        });

    let mut entries = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_video_file(entry.path(), extensions) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            entries.push(ScanEntry {
                path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    entries
}

/// Polling watcher emitting files that appear between scans
#[derive(Debug)]
pub struct PollingWatcher {
    root: PathBuf,
    exclude: PathBuf,
    extensions: Vec<String>,
    interval: Duration,
    known: HashSet<PathBuf>,
}

impl PollingWatcher {
    /// Create a watcher; files already present are remembered, not reported
    pub fn new(root: &Path, exclude: &Path, cfg: &WatchConfig) -> Self {
        let mut watcher = Self {
            root: root.to_path_buf(),
            exclude: normalize_path(exclude),
            extensions: cfg.extensions.clone(),
            interval: Duration::from_millis(cfg.poll_interval_ms),
            known: HashSet::new(),
        };
        watcher.known = watcher
            .scan()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        debug!(root = %watcher.root.display(), existing = watcher.known.len(), "watcher primed");
        watcher
    }

    fn scan(&self) -> Vec<ScanEntry> {
        scan_folder(&self.root, Some(&self.exclude), &self.extensions)
    }

    /// Rescan and return files not seen in the previous snapshot,
    /// oldest modification first
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        let mut entries = self.scan();
        entries.sort_by(|a, b| {
            a.modified_time
                .cmp(&b.modified_time)
                .then_with(|| a.path.cmp(&b.path))
        });

        let now = Local::now();
        let events = entries
            .iter()
            .filter(|entry| !self.known.contains(&entry.path))
            .map(|entry| WatchEvent {
                path: entry.path.clone(),
                detected_at: now,
            })
            .collect();

        self.known = entries.into_iter().map(|entry| entry.path).collect();
        events
    }

    /// Poll until abort or until the receiver goes away
    pub async fn run(mut self, tx: mpsc::Sender<WatchEvent>, abort: AbortSignal) {
        info!(
            root = %self.root.display(),
            interval = ?self.interval,
            "watching for new recordings"
        );
        loop {
            tokio::time::sleep(self.interval).await;
            if abort.is_triggered() {
                break;
            }
            for event in self.poll() {
                info!(path = %event.path.display(), "new recording detected");
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Settle timing applied by the ingest loop
#[derive(Debug, Clone, Copy)]
pub struct SettlePolicy {
    pub delay: Duration,
    pub extra_rounds: u32,
}

impl From<&WatchConfig> for SettlePolicy {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            delay: Duration::from_millis(cfg.settle_delay_ms),
            extra_rounds: cfg.settle_rounds,
        }
    }
}

/// Consume watch events in order: record detection, settle, enqueue
pub async fn run_ingest(
    mut rx: mpsc::Receiver<WatchEvent>,
    queue: Arc<IngestQueue>,
    settle: SettlePolicy,
    abort: AbortSignal,
) {
    while let Some(event) = rx.recv().await {
        if abort.is_triggered() {
            break;
        }
        if !queue.mark_detected(&event.path).await {
            continue;
        }

        match wait_until_settled(&event.path, settle.delay, settle.extra_rounds).await {
            Ok(StabilityResult::Stable) => {}
            Ok(StabilityResult::Unstable { current_size, .. }) => {
                warn!(
                    path = %event.path.display(),
                    current_size,
                    "file still changing after settle rounds, queueing anyway"
                );
            }
            Err(e) => {
                warn!(
                    path = %event.path.display(),
                    error = %e,
                    "recording vanished before it settled"
                );
                queue.finish(&event.path).await;
                continue;
            }
        }

        if abort.is_triggered() {
            queue.finish(&event.path).await;
            break;
        }
        let task = queue.enqueue(&event.path).await;
        debug!(task_id = %task.id, path = %event.path.display(), "queued");
    }
}
