//! Settle check for files that may still be written to.
//!
//! The recorder keeps writing a clip for a moment after it first appears, so
//! a new file waits until its size stops changing before it is queued.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the last wait.
    Stable,
    /// File size changed during the last wait.
    Unstable {
        /// Size before waiting.
        initial_size: u64,
        /// Size after waiting.
        current_size: u64,
    },
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

/// Wait `delay`, then compare sizes; while the file keeps growing, wait again
/// up to `extra_rounds` more times.
///
/// Returns the last comparison. An `Unstable` result means the rounds ran
/// out; callers process the file anyway.
pub async fn wait_until_settled(
    path: &Path,
    delay: Duration,
    extra_rounds: u32,
) -> Result<StabilityResult, std::io::Error> {
    let mut last_size = tokio::fs::metadata(path).await?.len();
    let mut round = 0;

    loop {
        sleep(delay).await;
        let current_size = tokio::fs::metadata(path).await?.len();
        let result = compare_sizes(last_size, current_size);

        if result == StabilityResult::Stable || round >= extra_rounds {
            return Ok(result);
        }

        debug!(
            path = %path.display(),
            last_size,
            current_size,
            round,
            "file still growing"
        );
        last_size = current_size;
        round += 1;
    }
}
