//! Adaptive size search.
//!
//! Output size falls as the quality parameter rises, but the relationship is
//! neither linear nor known up front. The search runs a handful of trial
//! encodes of the intermediate clip and keeps the one that lands inside the
//! configured size window, closest to the target.

use crate::abort::AbortSignal;
use crate::encode::{file_size_mb, thread_cap, EncodeError, EncodeParams, EncoderGateway};
use crate::replace::{place_artifact, remove_all_except, safe_remove, RetryPolicy, ReplaceError};
use clip_relay_config::{CompressionConfig, CompressionMethod};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fine-tuning never runs more rounds than this
const MAX_FINE_TUNE_ROUNDS: u32 = 5;

/// Trial encodes allowed on top of `max_attempts`
const EXTRA_TRIAL_BUDGET: u32 = 3;

/// Smallest trial above this multiple of the maximum triggers a re-extract
const FAR_ABOVE_FACTOR: f64 = 1.5;

/// Errors that end a search without an artifact.
#[derive(Debug, Error)]
pub enum SearchError {
    /// No trial encode produced a usable file
    #[error("Every trial encode failed")]
    AllTrialsFailed,

    /// Abort was requested during the search
    #[error("Search aborted")]
    Aborted,

    /// The selected artifact could not be moved to the final path
    #[error("Failed to place final artifact: {0}")]
    Placement(#[from] ReplaceError),

    /// The intermediate clip could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inputs for one file's search
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    /// High-quality trimmed clip the trials are encoded from
    pub intermediate: &'a Path,
    /// Original recording, used for the last-resort re-extract
    pub source: &'a Path,
    /// Trim start used for the intermediate
    pub trim_start_secs: f64,
    /// Directory all artifacts are written to
    pub output_dir: &'a Path,
    /// File name of the final output inside `output_dir`
    pub final_name: &'a str,
}

/// One finished trial encode
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub quality: u32,
    pub size_mb: f64,
    pub path: PathBuf,
}

/// Result of a successful search, after placement
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub final_path: PathBuf,
    pub size_mb: f64,
    /// Quality of the selected trial; None when the intermediate was kept
    pub selected_quality: Option<u32>,
    pub trials: Vec<Trial>,
    pub encoder_calls: u32,
}

#[derive(Debug, Clone)]
struct Selection {
    path: PathBuf,
    size_mb: f64,
    quality: Option<u32>,
}

/// Per-run bookkeeping, owned by a single search
#[derive(Debug, Default)]
struct SearchState {
    trials: Vec<Trial>,
    attempted: BTreeSet<u32>,
    created: Vec<PathBuf>,
    encoder_calls: u32,
}

/// Drives an [`EncoderGateway`] to bring a clip into the size window
pub struct SizeSearch<'a, G: EncoderGateway + ?Sized> {
    gateway: &'a G,
    cfg: &'a CompressionConfig,
    abort: &'a AbortSignal,
    retry: RetryPolicy,
}

impl<'a, G: EncoderGateway + ?Sized> SizeSearch<'a, G> {
    pub fn new(gateway: &'a G, cfg: &'a CompressionConfig, abort: &'a AbortSignal) -> Self {
        Self {
            gateway,
            cfg,
            abort,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Search, place the selected artifact at the final path and delete the rest.
    ///
    /// On error every trial artifact created by this run is removed; the
    /// intermediate is left to the caller.
    pub async fn run(&self, req: &SearchRequest<'_>) -> Result<SearchOutcome, SearchError> {
        let mut state = SearchState::default();

        let selection = match self.cfg.method {
            CompressionMethod::Quick => self.quick(req, &mut state).await,
            CompressionMethod::Progressive => self.progressive(req, &mut state).await,
        };

        let selection = match selection {
            Ok(selection) if !self.abort.is_triggered() => selection,
            Ok(_) => {
                self.discard(&state).await;
                return Err(SearchError::Aborted);
            }
            Err(e) => {
                self.discard(&state).await;
                return Err(e);
            }
        };

        self.finalize(req, state, selection).await
    }

    async fn quick(
        &self,
        req: &SearchRequest<'_>,
        state: &mut SearchState,
    ) -> Result<Selection, SearchError> {
        let quality = self.cfg.quick_quality;
        let name = format!("quick_{}", req.final_name);

        match self.trial(req, state, quality, name).await? {
            Some(trial) => Ok(selection_of(&trial)),
            None => {
                warn!("quick encode failed, keeping the intermediate clip");
                self.keep_intermediate(req)
            }
        }
    }

    async fn progressive(
        &self,
        req: &SearchRequest<'_>,
        state: &mut SearchState,
    ) -> Result<Selection, SearchError> {
        let cfg = self.cfg;
        let s0 = file_size_mb(req.intermediate)?;

        if cfg.in_window(s0) {
            info!(size_mb = s0, "intermediate already inside the size window");
            return self.keep_intermediate(req);
        }

        let q1 = initial_quality(s0, cfg);
        debug!(size_mb = s0, quality = q1, "starting size search");

        let Some(s1) = self
            .trial(req, state, q1, format!("init{}_{}", q1, req.final_name))
            .await?
            .map(|t| t.size_mb)
        else {
            return self.select(req, state).await;
        };
        if cfg.in_window(s1) {
            return self.select(req, state).await;
        }

        let q2 = second_guess(q1, s1, cfg);
        if q2 != q1 {
            if let Some(s2) = self
                .trial(req, state, q2, format!("jump{}_{}", q2, req.final_name))
                .await?
                .map(|t| t.size_mb)
            {
                if !cfg.in_window(s2) {
                    if let Some(q3) = bracket_quality((q1, s1), (q2, s2), cfg, &state.attempted) {
                        self.trial(req, state, q3, format!("mid{}_{}", q3, req.final_name))
                            .await?;
                    }
                }
            }
        }

        self.select(req, state).await
    }

    async fn select(
        &self,
        req: &SearchRequest<'_>,
        state: &mut SearchState,
    ) -> Result<Selection, SearchError> {
        let cfg = self.cfg;

        if let Some(best) = closest_in_window(&state.trials, cfg) {
            return Ok(best);
        }
        if state.trials.is_empty() {
            return Err(SearchError::AllTrialsFailed);
        }

        if let Some((quality, size_mb)) =
            largest_under_max(&state.trials, cfg).map(|t| (t.quality, t.size_mb))
        {
            self.fine_tune(req, state, quality, size_mb).await?;
            return match closest_in_window(&state.trials, cfg) {
                Some(best) => Ok(best),
                None => largest_under_max(&state.trials, cfg)
                    .map(selection_of)
                    .ok_or(SearchError::AllTrialsFailed),
            };
        }

        // every trial overshot the window
        let smallest = state
            .trials
            .iter()
            .min_by(|a, b| a.size_mb.total_cmp(&b.size_mb))
            .cloned()
            .ok_or(SearchError::AllTrialsFailed)?;

        if smallest.size_mb <= cfg.max_size_mb * FAR_ABOVE_FACTOR {
            warn!(
                quality = smallest.quality,
                size_mb = smallest.size_mb,
                "no trial fits, keeping the smallest"
            );
            return Ok(selection_of(&smallest));
        }

        let quality = cfg.quality_max.max(cfg.quality_min);
        info!(
            size_mb = smallest.size_mb,
            quality,
            "trials far above the window, re-extracting from the source"
        );
        match self.fallback_extract(req, state, quality).await? {
            Some(trial) if trial.size_mb <= cfg.max_size_mb => Ok(selection_of(&trial)),
            _ => {
                warn!("re-extract did not fit, keeping the intermediate clip");
                self.keep_intermediate(req)
            }
        }
    }

    /// Walk the quality down from the largest undersized trial
    async fn fine_tune(
        &self,
        req: &SearchRequest<'_>,
        state: &mut SearchState,
        mut current: u32,
        mut current_size: f64,
    ) -> Result<(), SearchError> {
        let cfg = self.cfg;
        let qmin = cfg.quality_min;
        let budget = cfg.max_attempts;

        let rounds = (budget - state.encoder_calls.min(budget) + 2)
            .min(MAX_FINE_TUNE_ROUNDS)
            .min((budget + EXTRA_TRIAL_BUDGET).saturating_sub(state.encoder_calls));

        for round in 1..=rounds {
            let deficit = (cfg.min_size_mb - current_size) / cfg.min_size_mb;
            let room = current.saturating_sub(qmin);
            let change = if deficit > 0.5 {
                room.min(6)
            } else if deficit > 0.3 {
                room.min(4)
            } else if deficit > 0.1 {
                room.min(2)
            } else {
                1
            };

            let mut next = current.saturating_sub(change).max(qmin);
            if state.attempted.contains(&next) {
                match (qmin..current).rev().find(|q| !state.attempted.contains(q)) {
                    Some(q) => next = q,
                    None => break,
                }
            }

            if current_size >= cfg.close_threshold * cfg.min_size_mb {
                debug!(quality = next, size_mb = current_size, "approaching the window");
            }

            let Some(size_mb) = self
                .trial(req, state, next, format!("finetune{}_{}", round, req.final_name))
                .await?
                .map(|t| t.size_mb)
            else {
                break;
            };

            if cfg.in_window(size_mb) {
                break;
            }
            if size_mb > cfg.max_size_mb {
                current = (current + next) / 2;
                current_size = size_mb;
            } else if size_mb > current_size {
                current = next;
                current_size = size_mb;
            }
        }

        Ok(())
    }

    /// Encode the intermediate at `quality`.
    ///
    /// A failed encode is logged and yields `None`; its quality still counts
    /// as attempted.
    async fn trial(
        &self,
        req: &SearchRequest<'_>,
        state: &mut SearchState,
        quality: u32,
        name: String,
    ) -> Result<Option<Trial>, SearchError> {
        self.check_abort()?;
        state.attempted.insert(quality);
        state.encoder_calls += 1;

        let path = req.output_dir.join(name);
        let params = self.params(quality);
        let result = self
            .gateway
            .transcode_whole(req.intermediate, &path, &params, self.abort)
            .await;

        self.record(state, quality, path, result)
    }

    /// Re-extract the trimmed range straight from the original recording
    async fn fallback_extract(
        &self,
        req: &SearchRequest<'_>,
        state: &mut SearchState,
        quality: u32,
    ) -> Result<Option<Trial>, SearchError> {
        self.check_abort()?;
        state.attempted.insert(quality);
        state.encoder_calls += 1;

        let path = req
            .output_dir
            .join(format!("final_compressed_{}", req.final_name));
        let params = self.params(quality);
        let result = self
            .gateway
            .extract_range(req.source, req.trim_start_secs, &path, &params, self.abort)
            .await;

        self.record(state, quality, path, result)
    }

    fn record(
        &self,
        state: &mut SearchState,
        quality: u32,
        path: PathBuf,
        result: Result<(), EncodeError>,
    ) -> Result<Option<Trial>, SearchError> {
        match result {
            Ok(()) => {}
            Err(EncodeError::Aborted) => return Err(SearchError::Aborted),
            Err(e) => {
                warn!(quality, error = %e, "trial encode failed");
                return Ok(None);
            }
        }

        state.created.push(path.clone());
        self.check_abort()?;

        match file_size_mb(&path) {
            Ok(size_mb) => {
                info!(
                    quality,
                    size_mb = %format!("{:.2}", size_mb),
                    in_window = self.cfg.in_window(size_mb),
                    "trial finished"
                );
                let trial = Trial {
                    quality,
                    size_mb,
                    path,
                };
                state.trials.push(trial.clone());
                Ok(Some(trial))
            }
            Err(e) => {
                warn!(quality, path = %path.display(), error = %e, "trial output unreadable");
                Ok(None)
            }
        }
    }

    fn params(&self, quality: u32) -> EncodeParams {
        EncodeParams::new(
            quality,
            self.cfg.compression_preset.clone(),
            thread_cap(self.cfg.threads),
        )
    }

    fn keep_intermediate(&self, req: &SearchRequest<'_>) -> Result<Selection, SearchError> {
        Ok(Selection {
            path: req.intermediate.to_path_buf(),
            size_mb: file_size_mb(req.intermediate)?,
            quality: None,
        })
    }

    fn check_abort(&self) -> Result<(), SearchError> {
        if self.abort.is_triggered() {
            Err(SearchError::Aborted)
        } else {
            Ok(())
        }
    }

    async fn discard(&self, state: &SearchState) {
        remove_all_except(&state.created, None, self.retry).await;
    }

    async fn finalize(
        &self,
        req: &SearchRequest<'_>,
        state: SearchState,
        selection: Selection,
    ) -> Result<SearchOutcome, SearchError> {
        let final_path = req.output_dir.join(req.final_name);

        if let Err(e) = place_artifact(&selection.path, &final_path, self.retry).await {
            self.discard(&state).await;
            return Err(e.into());
        }

        remove_all_except(&state.created, Some(&selection.path), self.retry).await;
        if selection.path != req.intermediate {
            if let Err(e) = safe_remove(req.intermediate, self.retry).await {
                warn!(error = %e, "intermediate clip left behind");
            }
        }

        info!(
            path = %final_path.display(),
            size_mb = %format!("{:.2}", selection.size_mb),
            quality = ?selection.quality,
            encoder_calls = state.encoder_calls,
            "clip placed"
        );

        Ok(SearchOutcome {
            final_path,
            size_mb: selection.size_mb,
            selected_quality: selection.quality,
            trials: state.trials,
            encoder_calls: state.encoder_calls,
        })
    }
}

/// First quality guess from the intermediate size
pub fn initial_quality(s0: f64, cfg: &CompressionConfig) -> u32 {
    let qmax = cfg.quality_max.max(cfg.quality_min);
    let guess = if s0 > 50.0 {
        qmax
    } else if s0 > 25.0 {
        (qmax as f64 * 0.9) as u32
    } else {
        (qmax as f64 * 0.75) as u32
    };
    guess.clamp(cfg.quality_min, qmax)
}

/// Second quality guess after a first trial missed the window
pub fn second_guess(q1: u32, s1: f64, cfg: &CompressionConfig) -> u32 {
    let qmin = cfg.quality_min;
    let qmax = cfg.quality_max.max(qmin);
    let step = cfg.quality_step;

    if s1 > cfg.max_size_mb {
        let jump = ((s1 / cfg.target_size_mb * 5.0) as u32).min(qmax.saturating_sub(q1));
        (q1 + jump).min(qmax)
    } else {
        let jump = if s1 >= cfg.medium_threshold * cfg.min_size_mb {
            step
        } else if s1 >= cfg.far_threshold * cfg.min_size_mb {
            2 * step
        } else {
            ((cfg.target_size_mb / s1.max(0.1) * 4.0) as u32).min(q1.saturating_sub(qmin))
        };
        q1.saturating_sub(jump).max(qmin)
    }
}

/// Interpolated third guess when two trials straddle the window.
///
/// Returns None when the trials do not bracket the window or no untried
/// quality lies strictly between them.
pub fn bracket_quality(
    first: (u32, f64),
    second: (u32, f64),
    cfg: &CompressionConfig,
    attempted: &BTreeSet<u32>,
) -> Option<u32> {
    let below = |s: f64| s < cfg.min_size_mb;
    let above = |s: f64| s > cfg.max_size_mb;

    let ((qa, sa), (qb, sb)) = if below(first.1) && above(second.1) {
        (first, second)
    } else if below(second.1) && above(first.1) {
        (second, first)
    } else {
        return None;
    };

    let (lo, hi) = (qa.min(qb), qa.max(qb));
    if hi - lo < 2 {
        return None;
    }

    let weight = (cfg.target_size_mb - sa) / (sb - sa);
    let raw = (qa as f64 + (qb as f64 - qa as f64) * weight * 0.7).trunc();
    let mut q3 = (raw.max(lo as f64) as u32).min(hi);

    if q3 == qa {
        q3 = if qb > qa { qa + 1 } else { qa - 1 };
    } else if q3 == qb {
        q3 = if qa > qb { qb + 1 } else { qb - 1 };
    }

    if !attempted.contains(&q3) {
        return Some(q3);
    }
    (lo + 1..hi)
        .filter(|q| !attempted.contains(q))
        .min_by_key(|q| q.abs_diff(q3))
}

fn closest_in_window(trials: &[Trial], cfg: &CompressionConfig) -> Option<Selection> {
    trials
        .iter()
        .filter(|t| cfg.in_window(t.size_mb))
        .min_by(|a, b| {
            (a.size_mb - cfg.target_size_mb)
                .abs()
                .total_cmp(&(b.size_mb - cfg.target_size_mb).abs())
        })
        .map(selection_of)
}

fn largest_under_max<'t>(trials: &'t [Trial], cfg: &CompressionConfig) -> Option<&'t Trial> {
    trials
        .iter()
        .filter(|t| t.size_mb <= cfg.max_size_mb)
        .max_by(|a, b| a.size_mb.total_cmp(&b.size_mb))
}

fn selection_of(trial: &Trial) -> Selection {
    Selection {
        path: trial.path.clone(),
        size_mb: trial.size_mb,
        quality: Some(trial.quality),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::fake::FakeEncoder;
    use crate::encode::BYTES_PER_MB;
    use proptest::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    const FINAL_NAME: &str = "Game-01022025-1200.mp4";

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        out: PathBuf,
        intermediate: PathBuf,
    }

    impl Fixture {
        fn new(intermediate_mb: f64) -> Self {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("source.mp4");
            File::create(&source).unwrap().set_len(64 * 1024 * 1024).unwrap();
            let out = dir.path().join("out");
            std::fs::create_dir(&out).unwrap();
            let intermediate = out.join(format!("temp_{}", FINAL_NAME));
            File::create(&intermediate)
                .unwrap()
                .set_len((intermediate_mb * BYTES_PER_MB).round() as u64)
                .unwrap();
            Self {
                _dir: dir,
                source,
                out,
                intermediate,
            }
        }

        fn request(&self) -> SearchRequest<'_> {
            SearchRequest {
                intermediate: &self.intermediate,
                source: &self.source,
                trim_start_secs: 45.0,
                output_dir: &self.out,
                final_name: FINAL_NAME,
            }
        }

        fn out_files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.out)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    fn progressive() -> CompressionConfig {
        CompressionConfig {
            method: CompressionMethod::Progressive,
            ..CompressionConfig::default()
        }
    }

    async fn run_search(
        encoder: &FakeEncoder,
        cfg: &CompressionConfig,
        fixture: &Fixture,
        abort: &AbortSignal,
    ) -> Result<SearchOutcome, SearchError> {
        SizeSearch::new(encoder, cfg, abort)
            .with_retry_policy(RetryPolicy::immediate(1))
            .run(&fixture.request())
            .await
    }

    #[test]
    fn test_initial_quality_tiers() {
        let cfg = progressive();
        assert_eq!(initial_quality(20.0, &cfg), 22);
        assert_eq!(initial_quality(40.0, &cfg), 27);
        assert_eq!(initial_quality(80.0, &cfg), 30);
    }

    #[test]
    fn test_second_guess_too_small_tiers() {
        let cfg = progressive();
        // within 2 MB of the minimum
        assert_eq!(second_guess(27, 7.4, &cfg), 26);
        // within 4 MB
        assert_eq!(second_guess(27, 5.0, &cfg), 25);
        // far off: trunc(9 / 2 * 4) = 18, limited by the room above qmin
        assert_eq!(second_guess(27, 2.0, &cfg), 9);
        assert_eq!(second_guess(5, 0.5, &cfg), 1);
    }

    #[test]
    fn test_second_guess_too_large() {
        let cfg = progressive();
        // trunc(18 / 9 * 5) = 10
        assert_eq!(second_guess(15, 18.0, &cfg), 25);
        assert_eq!(second_guess(27, 18.0, &cfg), 30);
        assert_eq!(second_guess(30, 40.0, &cfg), 30);
    }

    #[test]
    fn test_bracket_quality_interpolates_between_trials() {
        let cfg = progressive();
        let attempted: BTreeSet<u32> = [20, 30].into_iter().collect();
        // below at q30 (6 MB), above at q20 (14 MB): w = 3/8, 30 - 10 * 0.375 * 0.7 = 27.375
        assert_eq!(bracket_quality((30, 6.0), (20, 14.0), &cfg, &attempted), Some(27));
        assert_eq!(bracket_quality((20, 14.0), (30, 6.0), &cfg, &attempted), Some(27));
    }

    #[test]
    fn test_bracket_quality_nudges_off_endpoints() {
        let cfg = progressive();
        let attempted: BTreeSet<u32> = [24, 26].into_iter().collect();
        // w = 3 / 4.1, 26 - 2 * w * 0.7 = 24.98 truncates onto the oversized trial
        assert_eq!(bracket_quality((26, 6.0), (24, 10.1), &cfg, &attempted), Some(25));
    }

    #[test]
    fn test_bracket_quality_requires_interior_value() {
        let cfg = progressive();
        let attempted: BTreeSet<u32> = [24, 25].into_iter().collect();
        assert_eq!(bracket_quality((25, 6.0), (24, 12.0), &cfg, &attempted), None);
        // both undersized is not a bracket
        assert_eq!(bracket_quality((25, 6.0), (20, 7.0), &cfg, &attempted), None);
    }

    #[tokio::test]
    async fn test_first_guess_lands_in_window() {
        let fixture = Fixture::new(20.0);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 20.0);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(encoder.transcode_qualities(), vec![22]);
        assert_eq!(outcome.selected_quality, Some(22));
        assert!(cfg.in_window(outcome.size_mb));
        assert!((outcome.size_mb - 200.0 / 22.0).abs() < 1e-3);
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_second_guess_then_fine_tune_reaches_window() {
        let fixture = Fixture::new(40.0);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 40.0);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        // 27 -> 7.41 MB, 26 -> 7.69 MB, 25 -> 8.0 MB
        assert_eq!(encoder.transcode_qualities(), vec![27, 26, 25]);
        assert!(outcome.encoder_calls <= 4);
        assert!(cfg.in_window(outcome.size_mb));
        assert_eq!(outcome.selected_quality, Some(25));
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_fine_tune_steps_shrink_with_the_deficit() {
        let fixture = Fixture::new(5.0);
        let encoder = FakeEncoder::new(|q| 23.7 / (q as f64).sqrt(), 5.0);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        // 22 then the jump to 20, then fine-tune rounds of 4, 2, 2, 2 and 1
        assert_eq!(
            encoder.transcode_qualities(),
            vec![22, 20, 16, 14, 12, 10, 9]
        );
        assert_eq!(outcome.encoder_calls, 7);
        assert_eq!(outcome.selected_quality, Some(9));
        assert!((outcome.size_mb - 23.7 / 3.0).abs() < 1e-3);
        assert!(cfg.in_window(outcome.size_mb));
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_fine_tune_backs_off_after_overshoot() {
        let fixture = Fixture::new(5.0);
        let encoder = FakeEncoder::new(|q| 20.0 / (q as f64).powf(0.8), 5.0);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        // 22 -> 1.69 MB, 1 -> 20 MB, bracket 16 -> 2.18 MB, then steps of 6, 6, 2;
        // 2 overshoots to 11.5 MB, the back-off lands between tried values
        assert_eq!(encoder.transcode_qualities(), vec![22, 1, 16, 10, 4, 2]);
        assert_eq!(outcome.encoder_calls, 6);
        assert_eq!(outcome.selected_quality, Some(4));
        assert!((outcome.size_mb - 20.0 / 4f64.powf(0.8)).abs() < 1e-3);
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_inverse_size_curve_always_lands_in_window() {
        let cfg = progressive();
        for extract_mb in [5.0, 9.5, 20.0, 40.0, 80.0] {
            let fixture = Fixture::new(extract_mb);
            let encoder = FakeEncoder::new(|q| 200.0 / q as f64, extract_mb);

            let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
                .await
                .unwrap();

            assert!(
                cfg.in_window(outcome.size_mb),
                "{} MB extract ended at {} MB",
                extract_mb,
                outcome.size_mb
            );
            assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
        }
    }

    #[tokio::test]
    async fn test_intermediate_in_window_needs_no_trials() {
        let fixture = Fixture::new(9.2);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 9.2);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(encoder.encode_count(), 0);
        assert_eq!(outcome.encoder_calls, 0);
        assert_eq!(outcome.selected_quality, None);
        assert!(outcome.final_path.exists());
        assert!(!fixture.intermediate.exists());
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_far_oversized_trials_re_extract_from_source() {
        let fixture = Fixture::new(100.0);
        let encoder =
            FakeEncoder::new(|q| 1000.0 / q as f64, 100.0).with_extract_size(|_| 9.5);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        // q1 = 30 is already the ceiling, so there is no second guess
        assert_eq!(encoder.transcode_qualities(), vec![30]);
        assert_eq!(outcome.encoder_calls, 2);
        assert!((outcome.size_mb - 9.5).abs() < 1e-6);
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);

        let calls = encoder.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            crate::encode::fake::FakeCall::Extract { input, start_secs, quality: 30, .. }
                if input == &fixture.source && *start_secs == 45.0
        )));
    }

    #[tokio::test]
    async fn test_unfit_re_extract_keeps_intermediate() {
        let fixture = Fixture::new(100.0);
        let encoder =
            FakeEncoder::new(|q| 1000.0 / q as f64, 100.0).with_extract_size(|_| 12.0);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome.selected_quality, None);
        assert!((outcome.size_mb - 100.0).abs() < 1e-6);
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_slightly_oversized_keeps_smallest_trial() {
        let fixture = Fixture::new(30.0);
        // everything between 11 and 12 MB
        let encoder = FakeEncoder::new(|q| 12.0 - q as f64 / 30.0, 30.0);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        let smallest = outcome
            .trials
            .iter()
            .map(|t| t.size_mb)
            .fold(f64::INFINITY, f64::min);
        assert!((outcome.size_mb - smallest).abs() < 1e-9);
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_all_trials_failed() {
        let fixture = Fixture::new(40.0);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 40.0).failing_at(1..=30);
        let cfg = progressive();

        let result = run_search(&encoder, &cfg, &fixture, &AbortSignal::new()).await;

        assert!(matches!(result, Err(SearchError::AllTrialsFailed)));
        assert_eq!(encoder.encode_count(), 1);
        // the intermediate belongs to the caller
        assert_eq!(fixture.out_files(), vec![format!("temp_{}", FINAL_NAME)]);
    }

    #[tokio::test]
    async fn test_failed_trial_is_skipped() {
        let fixture = Fixture::new(40.0);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 40.0).failing_at([26]);
        let cfg = progressive();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        // 26 failed, fine-tune starts from 27 and never retries 26
        let qualities = encoder.transcode_qualities();
        assert_eq!(qualities.iter().filter(|q| **q == 26).count(), 1);
        assert!(cfg.in_window(outcome.size_mb));
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_abort_mid_search_removes_trials() {
        let fixture = Fixture::new(40.0);
        let abort = AbortSignal::new();
        let encoder =
            FakeEncoder::new(|q| 200.0 / q as f64, 40.0).aborting_at(2, abort.clone());
        let cfg = progressive();

        let result = run_search(&encoder, &cfg, &fixture, &abort).await;

        assert!(matches!(result, Err(SearchError::Aborted)));
        assert_eq!(encoder.encode_count(), 2);
        assert_eq!(fixture.out_files(), vec![format!("temp_{}", FINAL_NAME)]);
    }

    #[tokio::test]
    async fn test_quick_method_single_encode() {
        let fixture = Fixture::new(40.0);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 40.0);
        let cfg = CompressionConfig::default();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(encoder.transcode_qualities(), vec![40]);
        assert_eq!(outcome.encoder_calls, 1);
        assert_eq!(outcome.selected_quality, Some(40));
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_quick_method_failure_keeps_intermediate() {
        let fixture = Fixture::new(40.0);
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 40.0).failing_at([40]);
        let cfg = CompressionConfig::default();

        let outcome = run_search(&encoder, &cfg, &fixture, &AbortSignal::new())
            .await
            .unwrap();

        assert_eq!(encoder.encode_count(), 1);
        assert_eq!(outcome.selected_quality, None);
        assert!((outcome.size_mb - 40.0).abs() < 1e-6);
        assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_existing_final_file_is_replaced() {
        let fixture = Fixture::new(20.0);
        std::fs::write(fixture.out.join(FINAL_NAME), b"older clip").unwrap();
        let encoder = FakeEncoder::new(|q| 200.0 / q as f64, 20.0);

        let outcome = run_search(&encoder, &progressive(), &fixture, &AbortSignal::new())
            .await
            .unwrap();

        let len = std::fs::metadata(&outcome.final_path).unwrap().len();
        assert!(len > 1024 * 1024);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_trial_budget_and_cleanup(
            scale in 20.0f64..2000.0,
            exponent in 0.5f64..2.5,
            s0 in 2.0f64..120.0,
            max_attempts in 1u32..9,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let fixture = Fixture::new(s0);
            let encoder = FakeEncoder::new(
                move |q| (scale / (q as f64).powf(exponent)).max(0.05),
                s0,
            );
            let cfg = CompressionConfig {
                max_attempts,
                ..progressive()
            };

            let outcome = rt
                .block_on(run_search(&encoder, &cfg, &fixture, &AbortSignal::new()))
                .unwrap();

            prop_assert!(outcome.encoder_calls <= max_attempts + 3);
            prop_assert_eq!(encoder.encode_count() as u32, outcome.encoder_calls);
            prop_assert_eq!(fixture.out_files(), vec![FINAL_NAME.to_string()]);
            for quality in encoder.transcode_qualities() {
                prop_assert!((cfg.quality_min..=cfg.quality_max).contains(&quality));
            }
            if let Some(q) = outcome.selected_quality {
                prop_assert!(outcome.trials.iter().any(|t| t.quality == q));
            }
        }
    }
}
