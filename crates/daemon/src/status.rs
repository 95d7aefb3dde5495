//! Status snapshot for Clip Relay
//!
//! Shared counters describing what the daemon is doing, serialized as JSON by
//! the status server.

use crate::worker::TaskReport;
use crate::queue::TaskState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Point-in-time view of the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub running: bool,
    /// Source currently being processed
    pub processing: Option<PathBuf>,
    pub queue_len: usize,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub last_report: Option<TaskReport>,
}

impl StatusSnapshot {
    /// Fold a finished task into the counters
    pub fn record(&mut self, report: TaskReport) {
        match report.state {
            TaskState::Completed => self.completed += 1,
            TaskState::Aborted => self.aborted += 1,
            TaskState::Failed(_) => self.failed += 1,
            _ => {}
        }
        self.processing = None;
        self.last_report = Some(report);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.timestamp_unix_ms = chrono::Utc::now().timestamp_millis();
    }
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}
