//! In-process encoder used by the search and worker tests.
//!
//! Outputs are sparse files whose length follows a size function of the
//! quality parameter, so the search sees realistic MiB sizes without any
//! real encoding.

use super::{EncodeError, EncodeParams, EncoderGateway, ProbeError, SourceClip, BYTES_PER_MB};
use crate::abort::AbortSignal;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SizeFn = Arc<dyn Fn(u32) -> f64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FakeCall {
    Probe(PathBuf),
    Extract {
        input: PathBuf,
        start_secs: f64,
        quality: u32,
        output: PathBuf,
    },
    Transcode {
        input: PathBuf,
        quality: u32,
        output: PathBuf,
    },
}

#[derive(Clone)]
pub(crate) struct FakeEncoder {
    /// Output size of `transcode_whole` for a quality
    transcode_size: SizeFn,
    /// Output size of `extract_range` for a quality
    extract_size: SizeFn,
    duration_secs: f64,
    delay: Duration,
    failing_qualities: HashSet<u32>,
    fail_probe: bool,
    abort_at_call: Option<(usize, AbortSignal)>,
    calls: Arc<Mutex<Vec<FakeCall>>>,
    encodes: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeEncoder {
    /// Trial encodes follow `size`; extracts produce `extract_mb`
    pub(crate) fn new(
        size: impl Fn(u32) -> f64 + Send + Sync + 'static,
        extract_mb: f64,
    ) -> Self {
        Self {
            transcode_size: Arc::new(size),
            extract_size: Arc::new(move |_| extract_mb),
            duration_secs: 60.0,
            delay: Duration::ZERO,
            failing_qualities: HashSet::new(),
            fail_probe: false,
            abort_at_call: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            encodes: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_extract_size(
        mut self,
        size: impl Fn(u32) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.extract_size = Arc::new(size);
        self
    }

    pub(crate) fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing_at(mut self, qualities: impl IntoIterator<Item = u32>) -> Self {
        self.failing_qualities.extend(qualities);
        self
    }

    pub(crate) fn failing_probe(mut self) -> Self {
        self.fail_probe = true;
        self
    }

    /// Trigger `signal` when the `call`-th encode (1-based) starts
    pub(crate) fn aborting_at(mut self, call: usize, signal: AbortSignal) -> Self {
        self.abort_at_call = Some((call, signal));
        self
    }

    pub(crate) fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn encode_count(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    pub(crate) fn transcode_qualities(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Transcode { quality, .. } => Some(quality),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn encode(
        &self,
        quality: u32,
        size_mb: f64,
        output: &Path,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        let call = self.encodes.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.encode_inner(call, quality, size_mb, output, abort).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn encode_inner(
        &self,
        call: usize,
        quality: u32,
        size_mb: f64,
        output: &Path,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        if let Some((at, signal)) = &self.abort_at_call {
            if *at == call {
                signal.trigger();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if abort.is_triggered() {
            return Err(EncodeError::Aborted);
        }
        if self.failing_qualities.contains(&quality) {
            return Err(EncodeError::Failed {
                code: 1,
                stderr: format!("fake failure at quality {}", quality),
            });
        }

        let file = File::create(output)?;
        file.set_len((size_mb * BYTES_PER_MB).round() as u64)?;
        Ok(())
    }
}

#[async_trait]
impl EncoderGateway for FakeEncoder {
    async fn probe(&self, path: &Path) -> Result<SourceClip, ProbeError> {
        self.calls.lock().unwrap().push(FakeCall::Probe(path.to_path_buf()));
        if self.fail_probe {
            return Err(ProbeError::FfprobeFailed("fake probe failure".to_string()));
        }
        Ok(SourceClip {
            path: path.to_path_buf(),
            duration_secs: self.duration_secs,
            width: 1920,
            height: 1080,
            bitrate_kbps: 50_000.0,
        })
    }

    async fn extract_range(
        &self,
        input: &Path,
        start_secs: f64,
        output: &Path,
        params: &EncodeParams,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        self.calls.lock().unwrap().push(FakeCall::Extract {
            input: input.to_path_buf(),
            start_secs,
            quality: params.quality,
            output: output.to_path_buf(),
        });
        let size = (self.extract_size)(params.quality);
        self.encode(params.quality, size, output, abort).await
    }

    async fn transcode_whole(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParams,
        abort: &AbortSignal,
    ) -> Result<(), EncodeError> {
        self.calls.lock().unwrap().push(FakeCall::Transcode {
            input: input.to_path_buf(),
            quality: params.quality,
            output: output.to_path_buf(),
        });
        let size = (self.transcode_size)(params.quality);
        self.encode(params.quality, size, output, abort).await
    }
}
