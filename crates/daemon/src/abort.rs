//! Cooperative abort signal shared by the control plane, the worker and the encoder gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable handle to a process-wide abort flag
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that in-flight work stops at its next checkpoint
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear the flag before a new run starts
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
