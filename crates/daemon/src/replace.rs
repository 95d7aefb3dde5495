//! Artifact placement and temp-file removal.
//!
//! The selected artifact replaces whatever already sits at the final path, and
//! every other artifact of the run is deleted. Recorders and antivirus
//! scanners on Windows hold files open briefly, so removals and renames are
//! retried a few times before giving up.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while placing or removing artifacts.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The artifact to place does not exist.
    #[error("Artifact not found: {0}")]
    MissingSource(PathBuf),

    /// A file could not be removed after all retries.
    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The artifact could not be moved into place after all retries.
    #[error("Failed to move {from} to {to}: {source}")]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How often and how patiently a filesystem operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    async fn run<T>(
        &self,
        what: &str,
        path: &Path,
        mut op: impl FnMut() -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        attempts,
                        error = %e,
                        "{} failed, retrying",
                        what
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Remove a file, retrying while it is locked.
///
/// A file that is already gone counts as removed.
pub async fn safe_remove(path: &Path, policy: RetryPolicy) -> Result<(), ReplaceError> {
    let result = policy
        .run("remove", path, || match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await;

    result.map_err(|source| ReplaceError::RemoveFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Move `artifact` to `final_path`, replacing any existing file there.
///
/// The existing file is only ever swapped out by a rename, so a failed
/// placement leaves it untouched. Placing a file onto itself is a no-op.
pub async fn place_artifact(
    artifact: &Path,
    final_path: &Path,
    policy: RetryPolicy,
) -> Result<(), ReplaceError> {
    if artifact == final_path {
        return Ok(());
    }
    if !artifact.exists() {
        return Err(ReplaceError::MissingSource(artifact.to_path_buf()));
    }
    if final_path.exists() {
        debug!(path = %final_path.display(), "replacing existing output");
    }

    let result = policy
        .run("move", artifact, || move_into_place(artifact, final_path))
        .await;

    result.map_err(|source| ReplaceError::MoveFailed {
        from: artifact.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    })
}

/// Path next to `final_path` used to stage a cross-filesystem copy
pub fn staging_path(final_path: &Path) -> PathBuf {
    let mut staged = final_path.as_os_str().to_owned();
    staged.push(".partial");
    PathBuf::from(staged)
}

fn move_into_place(artifact: &Path, final_path: &Path) -> std::io::Result<()> {
    if fs::rename(artifact, final_path).is_ok() {
        return Ok(());
    }

    // different filesystem: copy beside the target, then swap it in by rename
    let staged = staging_path(final_path);
    if let Err(e) = fs::copy(artifact, &staged).and_then(|_| fs::rename(&staged, final_path)) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }

    if let Err(e) = fs::remove_file(artifact) {
        warn!(path = %artifact.display(), error = %e, "placed artifact copy, source left behind");
    }
    Ok(())
}

/// Remove every path in `paths` except `keep`, logging failures.
///
/// Returns how many files could not be removed.
pub async fn remove_all_except(
    paths: &[PathBuf],
    keep: Option<&Path>,
    policy: RetryPolicy,
) -> usize {
    let mut failures = 0;
    for path in paths {
        if Some(path.as_path()) == keep {
            continue;
        }
        if let Err(e) = safe_remove(path, policy).await {
            warn!(error = %e, "leaving artifact behind");
            failures += 1;
        }
    }
    failures
}
