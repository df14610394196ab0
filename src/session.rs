//! Per-image orchestration: load, segment, composite, download
//!
//! A session holds at most one source image. Loading a new image (or
//! resetting) bumps a generation counter; every `process` call carries the
//! [`RequestToken`] it was issued for, and a run whose token is no longer
//! current finishes as [`ProcessOutcome::Superseded`] without writing its
//! result.

use crate::compositor::Compositor;
use crate::config::{OutputFormat, PipelineConfig, QualityTier};
use crate::error::{CutoutError, Result};
use crate::segmentation::SegmentationAdapter;
use crate::types::{CompositeResult, SegmentationLabels, SourceImage};
use instant::Instant;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument};

/// Identifies the image a run was started for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    #[must_use]
    pub fn generation(self) -> u64 {
        self.0
    }
}

/// How a `process` call ended
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The result was stored and is returned
    Completed(Arc<CompositeResult>),
    /// A newer load or reset happened while the run was in flight
    Superseded,
}

impl ProcessOutcome {
    #[must_use]
    pub fn into_result(self) -> Option<Arc<CompositeResult>> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Superseded => None,
        }
    }

    #[must_use]
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    source: Option<Arc<SourceImage>>,
    labels: Option<Arc<SegmentationLabels>>,
    result: Option<Arc<CompositeResult>>,
}

/// Pipeline state for the image currently being edited
#[derive(Debug)]
pub struct CutoutSession {
    adapter: Arc<SegmentationAdapter>,
    generation: AtomicU64,
    state: Mutex<SessionState>,
}

impl CutoutSession {
    #[must_use]
    pub fn new(adapter: Arc<SegmentationAdapter>) -> Self {
        Self {
            adapter,
            generation: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
        }
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<SegmentationAdapter> {
        &self.adapter
    }

    /// Replace the source image, superseding any run in flight
    pub fn load(&self, image: SourceImage) -> RequestToken {
        let mut state = self.lock_state();
        let token = self.bump();
        info!(
            generation = token.0,
            width = image.width(),
            height = image.height(),
            "Loaded source image"
        );
        *state = SessionState {
            source: Some(Arc::new(image)),
            ..SessionState::default()
        };
        token
    }

    /// Decode and load an encoded image
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<RequestToken> {
        Ok(self.load(SourceImage::from_bytes(bytes)?))
    }

    /// Drop the source, labels and result
    pub fn reset(&self) -> RequestToken {
        let mut state = self.lock_state();
        let token = self.bump();
        *state = SessionState::default();
        debug!(generation = token.0, "Session reset");
        token
    }

    /// Token of the currently loaded image
    #[must_use]
    pub fn current_token(&self) -> RequestToken {
        RequestToken(self.generation.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_current(&self, token: RequestToken) -> bool {
        self.current_token() == token
    }

    #[must_use]
    pub fn source(&self) -> Option<Arc<SourceImage>> {
        self.lock_state().source.clone()
    }

    /// Latest stored composite
    #[must_use]
    pub fn result(&self) -> Option<Arc<CompositeResult>> {
        self.lock_state().result.clone()
    }

    /// Segment (or reuse cached labels) and composite the current image
    ///
    /// Labels are reused when the threshold matches the cached run, so a
    /// backdrop or refinement change only recomposites.
    ///
    /// # Errors
    /// - `InvalidInput` when no image is loaded for `token`
    /// - `ModelUnavailable` from segmentation
    /// - Compositing errors; nothing is stored on failure
    #[instrument(skip(self, config), fields(generation = token.0))]
    pub async fn process(&self, token: RequestToken, config: &PipelineConfig) -> Result<ProcessOutcome> {
        let total_start = Instant::now();

        let (source, cached) = {
            let state = self.lock_state();
            if !self.is_current(token) {
                return Ok(ProcessOutcome::Superseded);
            }
            let source = state
                .source
                .clone()
                .ok_or_else(|| CutoutError::invalid_input("No image loaded"))?;
            let cached = state
                .labels
                .clone()
                .filter(|labels| labels.threshold() == config.threshold);
            (source, cached)
        };

        let mut segmentation_ms = 0;
        let labels = match cached {
            Some(labels) => {
                debug!("Reusing cached segmentation labels");
                labels
            },
            None => {
                let start = Instant::now();
                let labels = self.adapter.segment(&source, config.threshold).await?;
                segmentation_ms = start.elapsed().as_millis() as u64;
                Arc::new(labels)
            },
        };

        if !self.is_current(token) {
            debug!("Run superseded during segmentation");
            return Ok(ProcessOutcome::Superseded);
        }

        let mut result = Compositor::render(&source, &labels, config)?;
        result.timings.segmentation_ms = segmentation_ms;
        result.timings.model_load_ms = self.adapter.model_load_ms().unwrap_or(0);
        result.timings.total_ms = total_start.elapsed().as_millis() as u64;
        let result = Arc::new(result);

        let mut state = self.lock_state();
        // Re-check under the lock: `load` bumps the generation while holding it
        if !self.is_current(token) {
            return Ok(ProcessOutcome::Superseded);
        }
        state.labels = Some(labels);
        state.result = Some(Arc::clone(&result));

        info!(timings = %result.timings.summary(), "Composite ready");
        Ok(ProcessOutcome::Completed(result))
    }

    /// Encode the stored result for download
    pub fn download(&self, format: OutputFormat, quality: QualityTier) -> Result<Vec<u8>> {
        let result = self
            .result()
            .ok_or_else(|| CutoutError::invalid_input("No processed result to download"))?;
        Compositor::encode(&result, format, quality)
    }

    fn bump(&self) -> RequestToken {
        RequestToken(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
