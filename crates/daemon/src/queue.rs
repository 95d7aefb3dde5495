//! Ingestion queue shared by the ingest loop and the worker
//!
//! A FIFO of [`ProcessingTask`]s plus a detection map keyed by normalized
//! path. Both sit behind one mutex; a [`Notify`] wakes the worker when work
//! arrives.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one detected file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Detected,
    Queued,
    Processing,
    Completed,
    Aborted,
    Failed(String),
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Detected => "detected",
            TaskState::Queued => "queued",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Aborted => "aborted",
            TaskState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Aborted | TaskState::Failed(_)
        )
    }
}

/// A recording waiting for, or undergoing, processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub id: String,
    pub source_path: PathBuf,
    pub detected_at: DateTime<Local>,
    pub enqueued_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
struct DetectionRecord {
    detected_at: DateTime<Local>,
    since: Instant,
    state: TaskState,
}

#[derive(Debug, Default)]
struct QueueInner {
    tasks: VecDeque<ProcessingTask>,
    detections: HashMap<PathBuf, DetectionRecord>,
}

/// Single-consumer FIFO with detection bookkeeping
#[derive(Debug, Default)]
pub struct IngestQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `path` was seen.
    ///
    /// Returns false when the path is already tracked, so a file reported
    /// twice is only processed once.
    pub async fn mark_detected(&self, path: &Path) -> bool {
        let key = normalize_path(path);
        let mut inner = self.inner.lock().await;
        if inner.detections.contains_key(&key) {
            debug!(path = %path.display(), "already tracked");
            return false;
        }
        inner.detections.insert(
            key,
            DetectionRecord {
                detected_at: Local::now(),
                since: Instant::now(),
                state: TaskState::Detected,
            },
        );
        true
    }

    /// Append a task for `path` and wake the worker
    pub async fn enqueue(&self, path: &Path) -> ProcessingTask {
        let key = normalize_path(path);
        let now = Local::now();

        let task = {
            let mut inner = self.inner.lock().await;
            let record = inner
                .detections
                .entry(key)
                .or_insert_with(|| DetectionRecord {
                    detected_at: now,
                    since: Instant::now(),
                    state: TaskState::Detected,
                });
            record.state = TaskState::Queued;

            let task = ProcessingTask {
                id: Uuid::new_v4().to_string(),
                source_path: path.to_path_buf(),
                detected_at: record.detected_at,
                enqueued_at: now,
            };
            inner.tasks.push_back(task.clone());
            task
        };

        self.notify.notify_one();
        task
    }

    /// Take the next task, waiting at most `poll` for one to arrive
    pub async fn pop(&self, poll: Duration) -> Option<ProcessingTask> {
        if let Some(task) = self.try_pop().await {
            return Some(task);
        }
        let _ = tokio::time::timeout(poll, self.notify.notified()).await;
        self.try_pop().await
    }

    async fn try_pop(&self) -> Option<ProcessingTask> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.pop_front()?;
        if let Some(record) = inner.detections.get_mut(&normalize_path(&task.source_path)) {
            record.state = TaskState::Processing;
        }
        Some(task)
    }

    /// Discard every queued task and its detection entry.
    ///
    /// Returns the number of tasks dropped. The task being processed is untouched.
    pub async fn drain(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let drained: Vec<ProcessingTask> = inner.tasks.drain(..).collect();
        for task in &drained {
            inner.detections.remove(&normalize_path(&task.source_path));
        }
        inner
            .detections
            .retain(|_, record| record.state != TaskState::Detected);
        drained.len()
    }

    /// Forget every task and detection.
    ///
    /// Only safe once nothing else is using the queue; returns the number of
    /// tracked paths dropped.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.tasks.clear();
        let tracked = inner.detections.len();
        inner.detections.clear();
        tracked
    }

    /// Time since `path` was detected
    pub async fn elapsed(&self, path: &Path) -> Option<Duration> {
        let inner = self.inner.lock().await;
        inner
            .detections
            .get(&normalize_path(path))
            .map(|record| record.since.elapsed())
    }

    /// Forget `path`, returning the time since it was detected
    pub async fn finish(&self, path: &Path) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        inner
            .detections
            .remove(&normalize_path(path))
            .map(|record| record.since.elapsed())
    }

    pub async fn state(&self, path: &Path) -> Option<TaskState> {
        let inner = self.inner.lock().await;
        inner
            .detections
            .get(&normalize_path(path))
            .map(|record| record.state.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.tasks.is_empty()
    }
}

/// Key used for the detection map.
///
/// Resolves the path when it exists so different spellings of one file
/// collide; on Windows the key is also case-folded.
pub fn normalize_path(path: &Path) -> PathBuf {
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if cfg!(windows) {
        PathBuf::from(resolved.to_string_lossy().to_lowercase())
    } else {
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = IngestQueue::new();
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            queue.enqueue(Path::new(name)).await;
        }

        let mut order = Vec::new();
        while let Some(task) = queue.pop(Duration::from_millis(1)).await {
            order.push(task.source_path);
        }
        assert_eq!(
            order,
            vec![
                PathBuf::from("a.mp4"),
                PathBuf::from("b.mp4"),
                PathBuf::from("c.mp4")
            ]
        );
    }

    #[tokio::test]
    async fn test_state_transitions_and_finish() {
        let queue = IngestQueue::new();
        let path = Path::new("/rec/Game/clip.mp4");

        assert!(queue.mark_detected(path).await);
        assert_eq!(queue.state(path).await, Some(TaskState::Detected));

        let task = queue.enqueue(path).await;
        assert_eq!(queue.state(path).await, Some(TaskState::Queued));
        assert_eq!(task.source_path, path);
        assert!(task.enqueued_at >= task.detected_at);

        let popped = queue.pop(Duration::from_millis(1)).await.unwrap();
        assert_eq!(popped.id, task.id);
        assert_eq!(queue.state(path).await, Some(TaskState::Processing));

        assert!(queue.finish(path).await.is_some());
        assert_eq!(queue.state(path).await, None);
        assert!(queue.finish(path).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_detection_is_rejected() {
        let queue = IngestQueue::new();
        let path = Path::new("/rec/Game/clip.mp4");
        assert!(queue.mark_detected(path).await);
        assert!(!queue.mark_detected(path).await);

        queue.finish(path).await;
        assert!(queue.mark_detected(path).await);
    }

    #[tokio::test]
    async fn test_normalized_paths_collide() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Game")).unwrap();
        let file = dir.path().join("Game").join("clip.mp4");
        std::fs::write(&file, b"x").unwrap();
        let dotted = dir.path().join("Game").join(".").join("clip.mp4");

        let queue = IngestQueue::new();
        assert!(queue.mark_detected(&file).await);
        assert!(!queue.mark_detected(&dotted).await);
    }

    #[tokio::test]
    async fn test_drain_discards_queued_but_not_processing() {
        let queue = IngestQueue::new();
        queue.enqueue(Path::new("first.mp4")).await;
        queue.enqueue(Path::new("second.mp4")).await;
        queue.enqueue(Path::new("third.mp4")).await;
        queue.mark_detected(Path::new("settling.mp4")).await;

        let in_flight = queue.pop(Duration::from_millis(1)).await.unwrap();
        assert_eq!(queue.drain().await, 2);

        assert!(queue.is_empty().await);
        assert_eq!(queue.state(Path::new("second.mp4")).await, None);
        assert_eq!(queue.state(Path::new("settling.mp4")).await, None);
        assert_eq!(
            queue.state(&in_flight.source_path).await,
            Some(TaskState::Processing)
        );
    }

    #[tokio::test]
    async fn test_clear_forgets_everything() {
        let queue = IngestQueue::new();
        let settling = Path::new("settling.mp4");
        queue.mark_detected(settling).await;
        queue.enqueue(Path::new("queued.mp4")).await;
        queue.enqueue(Path::new("cut-short.mp4")).await;
        queue.pop(Duration::from_millis(1)).await.unwrap();

        assert_eq!(queue.clear().await, 3);

        assert!(queue.is_empty().await);
        assert_eq!(queue.state(Path::new("queued.mp4")).await, None);
        assert_eq!(queue.state(Path::new("cut-short.mp4")).await, None);
        assert!(queue.mark_detected(settling).await);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = IngestQueue::new();
        let started = Instant::now();
        assert!(queue.pop(Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_enqueue() {
        let queue = Arc::new(IngestQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(Path::new("late.mp4")).await;

        let task = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.unwrap().source_path, PathBuf::from("late.mp4"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed("probe".into()).is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert_eq!(TaskState::Processing.as_str(), "processing");
    }
}
