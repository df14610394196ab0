//! Error types for cutout operations

use thiserror::Error;

/// Result type alias for cutout operations
pub type Result<T> = std::result::Result<T, CutoutError>;

/// Error kinds surfaced by the segmentation, compositing and service layers
///
/// Every error is terminal for the attempt that produced it. The caller
/// re-triggers (re-upload, re-run) to try again.
#[derive(Error, Debug)]
pub enum CutoutError {
    /// Model initialization or inference failed
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Input rejected before any processing (type, size, dimensions)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An output surface could not be allocated or drawn
    #[error("Rendering context unavailable: {0}")]
    RenderingContext(String),

    /// Invalid pipeline configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Settings update failed validation
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Settings serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Model download errors
    #[error("Network error: {0}")]
    Network(String),
}

impl CutoutError {
    pub fn model_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn rendering_context<S: Into<String>>(msg: S) -> Self {
        Self::RenderingContext(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn invalid_settings<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSettings(msg.into())
    }

    /// Create a network error carrying the underlying cause
    pub fn network_error<E: std::fmt::Display>(context: impl Into<String>, error: E) -> Self {
        Self::Network(format!("{}: {}", context.into(), error))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        Self::Io(std::io::Error::new(
            error.kind(),
            format!(
                "Failed to {} '{}': {}",
                operation,
                path.as_ref().display(),
                error
            ),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Create settings error naming the offending field
    pub fn settings_value_error<T: std::fmt::Display>(
        field: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidSettings(format!(
            "{} = {} is outside the valid range {}",
            field, value, valid_range
        ))
    }

    /// Create model error with the stage that failed
    pub fn model_stage_error(stage: &str, details: impl std::fmt::Display) -> Self {
        Self::ModelUnavailable(format!("{} failed: {}", stage, details))
    }

    /// Whether this error was raised before any processing began
    #[must_use]
    pub fn is_input_rejection(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::InvalidSettings(_))
    }
}
