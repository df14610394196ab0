//! Segmentation adapter with lazily initialized, shared model handle
//!
//! The adapter owns the model lifecycle as an explicit state machine:
//!
//! ```text
//! Uninitialized --segment--> Initializing --ok--> Ready
//!                                 |
//!                                 +--err--> Failed --segment--> Initializing
//! ```
//!
//! Concurrent callers that find the model `Initializing` await the same
//! memoized future, so exactly one load is ever in flight. A failed load is
//! not retried automatically; the next explicit call starts a new attempt.

use crate::error::{CutoutError, Result};
use crate::inference::InferenceBackend;
use crate::models::ModelInfo;
use crate::types::{SegmentationLabels, SourceImage, Threshold};
use crate::utils::ImagePreprocessor;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use instant::Instant;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Produces a ready-to-run inference backend
///
/// Implementations may download weights and build the graph; the adapter
/// guarantees `load` is never invoked concurrently with itself.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Box<dyn InferenceBackend>>;
}

/// Observable lifecycle state of the model handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Uninitialized,
    Initializing,
    Ready,
    /// Last attempt failed with this message
    Failed(String),
}

struct LoadedModel {
    backend: Mutex<Box<dyn InferenceBackend>>,
    info: ModelInfo,
    load_ms: u64,
}

type InitFuture = Shared<BoxFuture<'static, std::result::Result<Arc<LoadedModel>, String>>>;

enum Slot {
    Uninitialized,
    Initializing { attempt: usize, future: InitFuture },
    Ready(Arc<LoadedModel>),
    Failed(String),
}

/// Shared handle to the segmentation model
///
/// Pass it around in an `Arc`; all methods take `&self`.
pub struct SegmentationAdapter {
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Slot>,
    attempts: AtomicUsize,
}

impl std::fmt::Debug for SegmentationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationAdapter")
            .field("state", &self.state())
            .field("attempts", &self.initialization_attempts())
            .finish_non_exhaustive()
    }
}

impl SegmentationAdapter {
    #[must_use]
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(Slot::Uninitialized),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Adapter backed by the Tract ONNX engine
    #[cfg(feature = "tract")]
    #[must_use]
    pub fn tract(spec: crate::models::ModelSpec, fetcher: crate::download::ModelFetcher) -> Self {
        Self::new(Arc::new(crate::backends::TractModelLoader::new(spec, fetcher)))
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ModelState {
        match &*self.lock_slot() {
            Slot::Uninitialized => ModelState::Uninitialized,
            Slot::Initializing { .. } => ModelState::Initializing,
            Slot::Ready(_) => ModelState::Ready,
            Slot::Failed(message) => ModelState::Failed(message.clone()),
        }
    }

    /// Number of model loads started so far
    #[must_use]
    pub fn initialization_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Metadata of the loaded model, once ready
    #[must_use]
    pub fn model_info(&self) -> Option<ModelInfo> {
        match &*self.lock_slot() {
            Slot::Ready(model) => Some(model.info.clone()),
            _ => None,
        }
    }

    /// Time the successful load took, once ready
    #[must_use]
    pub fn model_load_ms(&self) -> Option<u64> {
        match &*self.lock_slot() {
            Slot::Ready(model) => Some(model.load_ms),
            _ => None,
        }
    }

    /// Load the model now instead of on first use
    pub async fn initialize(&self) -> Result<()> {
        self.ready_model().await.map(|_| ())
    }

    /// Classify every pixel of `image` as foreground or background
    ///
    /// # Errors
    /// - `ModelUnavailable` when initialization or inference fails
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height(), threshold = threshold.value()))]
    pub async fn segment(
        &self,
        image: &SourceImage,
        threshold: Threshold,
    ) -> Result<SegmentationLabels> {
        let model = self.ready_model().await?;
        let dimensions = image.dimensions();
        let pixels = image.as_rgba().clone();

        let start = Instant::now();
        let confidence = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let mut backend = model
                .backend
                .lock()
                .map_err(|_| CutoutError::model_unavailable("Model handle poisoned by an earlier panic"))?;
            let config = backend.preprocessing_config();
            let (tensor, transform) = ImagePreprocessor::preprocess(&pixels, &config)?;
            let output = backend.infer(&tensor)?;
            Ok(transform.project(&output))
        })
        .await
        .map_err(|e| CutoutError::model_stage_error("inference", e))?
        .map_err(|e| match e {
            CutoutError::ModelUnavailable(_) | CutoutError::InvalidInput(_) => e,
            other => CutoutError::model_stage_error("inference", other),
        })?;

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Segmentation inference finished");
        SegmentationLabels::from_confidence(dimensions, confidence, threshold)
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn ready_model(&self) -> Result<Arc<LoadedModel>> {
        let (attempt, future) = {
            let mut slot = self.lock_slot();
            match &*slot {
                Slot::Ready(model) => return Ok(Arc::clone(model)),
                Slot::Initializing { attempt, future } => (*attempt, future.clone()),
                Slot::Uninitialized | Slot::Failed(_) => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(attempt, "Initializing segmentation model");
                    let future = Self::start_load(Arc::clone(&self.loader));
                    *slot = Slot::Initializing {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                },
            }
        };

        let outcome = future.await;

        let mut slot = self.lock_slot();
        // Only the attempt that is still current may settle the slot
        let current = matches!(&*slot, Slot::Initializing { attempt: a, .. } if *a == attempt);
        match outcome {
            Ok(model) => {
                if current {
                    info!(load_ms = model.load_ms, model = %model.info.name, "Segmentation model ready");
                    *slot = Slot::Ready(Arc::clone(&model));
                }
                Ok(model)
            },
            Err(message) => {
                if current {
                    warn!(error = %message, "Segmentation model failed to initialize");
                    *slot = Slot::Failed(message.clone());
                }
                Err(CutoutError::model_unavailable(message))
            },
        }
    }

    fn start_load(loader: Arc<dyn ModelLoader>) -> InitFuture {
        async move {
            let start = Instant::now();
            let backend = loader.load().await.map_err(|e| match e {
                CutoutError::ModelUnavailable(message) => message,
                other => other.to_string(),
            })?;
            let info = backend.model_info();
            Ok(Arc::new(LoadedModel {
                backend: Mutex::new(backend),
                info,
                load_ms: start.elapsed().as_millis() as u64,
            }))
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PreprocessingConfig;
    use image::{Rgba, RgbaImage};
    use ndarray::Array4;

    struct ConstantBackend(f32);

    impl InferenceBackend for ConstantBackend {
        fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
            let shape = input.shape();
            Ok(Array4::from_elem((1, 1, shape[2], shape[3]), self.0))
        }

        fn preprocessing_config(&self) -> PreprocessingConfig {
            PreprocessingConfig {
                target_size: [16, 16],
                ..PreprocessingConfig::default()
            }
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "constant".to_string(),
                precision: "fp32".to_string(),
                size_bytes: 0,
                input_shape: (1, 3, 16, 16),
                output_shape: (1, 1, 16, 16),
            }
        }
    }

    struct FlakyLoader {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl ModelLoader for FlakyLoader {
        async fn load(&self) -> Result<Box<dyn InferenceBackend>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if call < self.fail_first {
                Err(CutoutError::model_unavailable("weights corrupt"))
            } else {
                Ok(Box::new(ConstantBackend(0.9)))
            }
        }
    }

    fn image() -> SourceImage {
        SourceImage::from_rgba(RgbaImage::from_pixel(8, 4, Rgba([10, 20, 30, 255]))).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_initialization() {
        let loader = Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let adapter = Arc::new(SegmentationAdapter::new(loader.clone()));
        assert_eq!(adapter.state(), ModelState::Uninitialized);

        let source = image();
        let threshold = Threshold::default();
        let (a, b, c) = tokio::join!(
            adapter.segment(&source, threshold),
            adapter.segment(&source, threshold),
            adapter.segment(&source, threshold),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.initialization_attempts(), 1);
        assert_eq!(adapter.state(), ModelState::Ready);

        let labels = a.unwrap();
        assert_eq!(labels.dimensions(), (8, 4));
        assert_eq!(labels.foreground_count(), 32);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_until_retriggered() {
        let loader = Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let adapter = SegmentationAdapter::new(loader.clone());

        let err = adapter.segment(&image(), Threshold::default()).await.unwrap_err();
        assert!(matches!(err, CutoutError::ModelUnavailable(_)));
        assert!(matches!(adapter.state(), ModelState::Failed(msg) if msg.contains("weights corrupt")));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        // Explicit re-trigger starts a fresh attempt
        assert!(adapter.segment(&image(), Threshold::default()).await.is_ok());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.state(), ModelState::Ready);
        assert!(adapter.model_info().is_some());
    }

    #[tokio::test]
    async fn test_threshold_applies_to_confidence() {
        let loader = Arc::new(FlakyLoader {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let adapter = SegmentationAdapter::new(loader);

        let strict = Threshold::new(0.95).unwrap();
        let labels = adapter.segment(&image(), strict).await.unwrap();
        assert_eq!(labels.foreground_count(), 0);
    }
}
