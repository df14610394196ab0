#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # IMG.LY Cutout Library
//!
//! Background removal with mask refinement and backdrop compositing, plus
//! the settings and upload services around it.
//!
//! An `ISNet` segmentation model classifies every pixel as foreground or
//! background. The resulting labels become a binary (or alpha-matted) mask,
//! the mask is optionally dilated, and the subject is composited over a
//! transparent, solid-color or image backdrop with an optional edge feather.
//!
//! ## Features
//!
//! - **Pure Rust inference**: Tract ONNX backend, models fetched from `HuggingFace` and cached
//! - **Memoized model handle**: concurrent callers share one initialization
//! - **Mask refinement**: neighbor-expansion or blur-threshold dilation, feathering
//! - **Backdrops**: transparent, `#rrggbb` color, or a cover-scaled image
//! - **Sessions**: a new load supersedes in-flight work; cached labels make backdrop changes cheap
//! - **Services**: validated settings record with atomic persistence, upload store with scheduled cleanup
//! - **CLI Integration**: Optional command-line interface (enable with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imgly_cutout::{
//!     Backdrop, CutoutSession, ModelFetcher, ModelSpec, OutputFormat, PipelineConfig,
//!     QualityTier, SegmentationAdapter,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let adapter = Arc::new(SegmentationAdapter::tract(ModelSpec::default(), ModelFetcher::new()?));
//! let session = CutoutSession::new(adapter);
//!
//! let token = session.load_bytes(&std::fs::read("input.jpg")?)?;
//! let config = PipelineConfig::builder()
//!     .threshold_percent(50)
//!     .dilation_radius(2)
//!     .backdrop(Backdrop::Color([255, 255, 255]))
//!     .build()?;
//!
//! if session.process(token, &config).await?.into_result().is_some() {
//!     let png = session.download(OutputFormat::Png, QualityTier::High)?;
//!     std::fs::write("output.png", png)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): Pure Rust ONNX inference backend
//! - `cli` (default): Command-line interface and progress reporting
//! - `webp-support` (default): WebP upload decoding
//! - `tracing-json`: JSON log output for the CLI
//!
//! ### Library-Only Usage
//!
//! ```toml
//! [dependencies]
//! imgly-cutout = { version = "0.1", default-features = false, features = ["tract"] }
//! ```

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod compositor;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod mask;
pub mod models;
pub mod refine;
pub mod segmentation;
pub mod session;
pub mod settings;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod transform;
pub mod types;
pub mod upload;
pub mod utils;

use std::sync::Arc;
use tokio::io::AsyncRead;

// Public API exports
pub use backends::*;
pub use compositor::Compositor;
pub use config::{
    parse_hex_color, Backdrop, DilationStrategy, FeatherConfig, MattingBand, OutputFormat,
    PipelineConfig, PipelineConfigBuilder, QualityTier, RefinementConfig,
};
pub use download::{default_cache_dir, ModelFetcher, CACHE_DIR_ENV};
pub use error::{CutoutError, Result};
pub use inference::InferenceBackend;
pub use mask::MaskBuilder;
pub use models::{ModelChoice, ModelInfo, ModelSource, ModelSpec, PreprocessingConfig};
pub use refine::MaskRefiner;
pub use segmentation::{ModelLoader, ModelState, SegmentationAdapter};
pub use session::{CutoutSession, ProcessOutcome, RequestToken};
pub use settings::{BackdropType, Settings, SettingsPatch, SettingsStore};
pub use transform::{InteractiveView, Permissions, ViewTransform};
pub use types::{
    CompositeResult, Mask, MaskStatistics, ProcessingTimings, SegmentationLabels, SourceImage,
    Threshold,
};
pub use upload::{
    detect_mime_type, CleanupPolicy, CleanupReport, CleanupTask, StoredUpload, UploadPolicy,
    UploadService,
};
pub use utils::{ImagePreprocessor, LetterboxTransform};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, spans, TracingConfig, TracingFormat};

/// Cut out the subject of an encoded image in one call
///
/// Decodes `image_bytes`, segments it with `adapter` and composites the
/// result. Use a [`CutoutSession`] instead when the same image is
/// recomposited with different settings.
///
/// # Examples
///
/// ```rust,no_run
/// use imgly_cutout::{cutout_from_bytes, ModelFetcher, ModelSpec, PipelineConfig, SegmentationAdapter};
/// use std::sync::Arc;
///
/// # async fn example(upload_bytes: Vec<u8>) -> anyhow::Result<()> {
/// let adapter = Arc::new(SegmentationAdapter::tract(ModelSpec::default(), ModelFetcher::new()?));
/// let result = cutout_from_bytes(&adapter, &upload_bytes, &PipelineConfig::default()).await?;
/// assert!(!result.has_opaque_backdrop());
/// # Ok(())
/// # }
/// ```
pub async fn cutout_from_bytes(
    adapter: &Arc<SegmentationAdapter>,
    image_bytes: &[u8],
    config: &PipelineConfig,
) -> Result<CompositeResult> {
    let source = SourceImage::from_bytes(image_bytes)?;
    let labels = adapter.segment(&source, config.threshold).await?;
    Compositor::render(&source, &labels, config)
}

/// Cut out the subject of an image read from an async stream
pub async fn cutout_from_reader<R: AsyncRead + Unpin>(
    adapter: &Arc<SegmentationAdapter>,
    mut reader: R,
    config: &PipelineConfig,
) -> Result<CompositeResult> {
    let mut buffer = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffer)
        .await
        .map_err(|e| CutoutError::invalid_input(format!("Failed to read from stream: {}", e)))?;

    cutout_from_bytes(adapter, &buffer, config).await
}
