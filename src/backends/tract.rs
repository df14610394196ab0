//! Tract backend implementation for segmentation models
//!
//! Tract is a pure Rust ONNX inference engine, so this backend needs no
//! native libraries and is the default.

use crate::download::ModelFetcher;
use crate::error::{CutoutError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelSpec, PreprocessingConfig};
use crate::segmentation::ModelLoader;
use async_trait::async_trait;
use instant::Instant;
use ndarray::Array4;
use std::path::Path;
use tracing::{debug, info, instrument};
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tract backend for running segmentation models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model: TractModel,
    preprocessing: PreprocessingConfig,
    info: ModelInfo,
}

impl TractBackend {
    /// Load, optimize and prepare an ONNX model for inference
    ///
    /// # Errors
    /// - Model file unreadable
    /// - ONNX graph cannot be parsed, typed or optimized
    #[instrument(skip(spec), fields(model = %spec.name))]
    pub fn load(path: &Path, spec: &ModelSpec) -> Result<Self> {
        let model_load_start = Instant::now();

        let model_data = std::fs::read(path)
            .map_err(|e| CutoutError::file_io_error("read model file", path, &e))?;
        let size_bytes = model_data.len();
        let size = spec.preprocessing.target_size[0] as usize;

        info!(
            model = %spec.name,
            precision = %spec.precision,
            size_mb = size_bytes as f64 / (1024.0 * 1024.0),
            "Initializing Tract backend"
        );

        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| CutoutError::model_stage_error("ONNX parsing", e))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .map_err(|e| CutoutError::model_stage_error("input shape binding", e))?
            .into_optimized()
            .map_err(|e| CutoutError::model_stage_error("optimization", e))?
            .into_runnable()
            .map_err(|e| CutoutError::model_stage_error("runnable model creation", e))?;

        info!(
            elapsed_ms = model_load_start.elapsed().as_millis() as u64,
            "Tract backend ready"
        );

        Ok(Self {
            model,
            preprocessing: spec.preprocessing,
            info: ModelInfo {
                name: spec.name.clone(),
                precision: spec.precision.clone(),
                size_bytes,
                input_shape: (1, 3, size, size),
                output_shape: (1, 1, size, size),
            },
        })
    }
}

impl InferenceBackend for TractBackend {
    #[allow(clippy::get_first)]
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        debug!(shape = ?input.shape(), "Running Tract inference");
        let inference_start = Instant::now();

        let input_tensor = Tensor::from(input.clone());

        let outputs = self
            .model
            .run(tvec![input_tensor.into()])
            .map_err(|e| CutoutError::model_stage_error("inference", e))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| CutoutError::model_stage_error("inference", "no output tensor"))?
            .into_arc_tensor();

        let output_data = output_tensor
            .to_array_view::<f32>()
            .map_err(|e| CutoutError::model_stage_error("output conversion", e))?;

        let output_shape = output_data.shape();
        if output_shape.len() != 4 {
            return Err(CutoutError::model_stage_error(
                "output conversion",
                format!("expected 4D output tensor, got {}D", output_shape.len()),
            ));
        }

        let output_array = Array4::from_shape_vec(
            (
                output_shape.get(0).copied().unwrap_or(1),
                output_shape.get(1).copied().unwrap_or(1),
                output_shape.get(2).copied().unwrap_or(1),
                output_shape.get(3).copied().unwrap_or(1),
            ),
            output_data.iter().copied().collect(),
        )
        .map_err(|e| CutoutError::model_stage_error("output reshape", e))?;

        debug!(
            elapsed_ms = inference_start.elapsed().as_millis() as u64,
            shape = ?output_array.shape(),
            "Tract inference completed"
        );

        Ok(output_array)
    }

    fn preprocessing_config(&self) -> PreprocessingConfig {
        self.preprocessing
    }

    fn model_info(&self) -> ModelInfo {
        self.info.clone()
    }
}

/// Loader resolving a model spec through the fetcher and building a Tract backend
#[derive(Debug, Clone)]
pub struct TractModelLoader {
    spec: ModelSpec,
    fetcher: ModelFetcher,
}

impl TractModelLoader {
    #[must_use]
    pub fn new(spec: ModelSpec, fetcher: ModelFetcher) -> Self {
        Self { spec, fetcher }
    }

    #[must_use]
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }
}

#[async_trait]
impl ModelLoader for TractModelLoader {
    async fn load(&self) -> Result<Box<dyn InferenceBackend>> {
        let path = self.fetcher.resolve(&self.spec).await?;
        let spec = self.spec.clone();

        // Graph optimization is CPU-bound
        let backend = tokio::task::spawn_blocking(move || TractBackend::load(&path, &spec))
            .await
            .map_err(|e| CutoutError::model_stage_error("initialization", e))??;

        Ok(Box::new(backend))
    }
}
