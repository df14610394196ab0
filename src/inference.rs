//! Inference backend abstraction

use crate::error::Result;
use crate::models::{ModelInfo, PreprocessingConfig};
use ndarray::Array4;

/// A loaded segmentation network
///
/// Backends are produced ready to run by a [`ModelLoader`](crate::segmentation::ModelLoader);
/// initialization is the loader's concern, so there is no uninitialized state here.
pub trait InferenceBackend: Send {
    /// Run inference on an NCHW input tensor
    ///
    /// The output is an `(1, 1, H, W)` confidence map in the model's input space.
    ///
    /// # Errors
    /// - Model inference failures
    /// - Tensor conversion or processing errors
    /// - Invalid input tensor dimensions
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Preprocessing expected by this backend
    fn preprocessing_config(&self) -> PreprocessingConfig;

    /// Model information for this backend
    fn model_info(&self) -> ModelInfo;
}
