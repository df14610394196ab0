//! Configuration types for cutout pipeline runs

use crate::error::{CutoutError, Result};
use crate::settings::{BackdropType, Settings};
use crate::types::Threshold;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Output image format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG with alpha channel transparency
    #[default]
    Png,
    /// JPEG, only valid for opaque backdrops
    Jpeg,
}

impl OutputFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    #[must_use]
    pub fn supports_transparency(self) -> bool {
        matches!(self, Self::Png)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Png => write!(f, "png"),
            Self::Jpeg => write!(f, "jpeg"),
        }
    }
}

/// Caller-chosen quality tier for downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    #[default]
    High,
    Maximum,
}

impl QualityTier {
    /// JPEG quality (1-100) for this tier
    #[must_use]
    pub fn jpeg_quality(self) -> u8 {
        match self {
            Self::Low => 60,
            Self::Medium => 80,
            Self::High => 92,
            Self::Maximum => 100,
        }
    }
}

/// Dilation strategy for growing the foreground region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DilationStrategy {
    /// Discrete 4-connected growth, one pixel ring per iteration
    #[default]
    NeighborExpansion,
    /// Gaussian blur then re-threshold at 50%, unioned with the input
    BlurThreshold,
}

/// Mask refinement applied before compositing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RefinementConfig {
    pub strategy: DilationStrategy,
    /// Iterations for neighbor expansion, blur radius for blur-threshold
    pub radius: u32,
}

impl RefinementConfig {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.radius == 0
    }
}

/// Edge feather applied to the composited surface
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatherConfig {
    /// Blur radius in pixels (Gaussian sigma)
    pub radius: f32,
    /// Blend weight of the blurred surface, 0.0-1.0
    pub opacity: f32,
}

impl FeatherConfig {
    #[must_use]
    pub fn new(radius: f32, opacity: f32) -> Self {
        Self { radius, opacity }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.radius <= 0.0 || self.opacity <= 0.0
    }
}

/// Confidence band softened by alpha matting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MattingBand {
    pub background: Threshold,
    pub foreground: Threshold,
}

/// Surface composited behind the cutout subject
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Backdrop {
    /// Keep the alpha channel
    #[default]
    Transparent,
    /// Opaque solid color
    Color([u8; 3]),
    /// Image stretched to cover the output
    Image(Arc<RgbaImage>),
}

impl Backdrop {
    /// Load an image backdrop from disk
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| {
            CutoutError::invalid_input(format!(
                "Failed to load backdrop image '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::Image(Arc::new(image.to_rgba8())))
    }

    /// Whether the backdrop covers every output pixel at full alpha
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        match self {
            Self::Transparent => false,
            Self::Color(_) => true,
            Self::Image(image) => image.pixels().all(|p| p[3] == u8::MAX),
        }
    }
}

/// Parse `#rrggbb` or `#rgb`
pub fn parse_hex_color(value: &str) -> Result<[u8; 3]> {
    let invalid = || {
        CutoutError::invalid_config(format!(
            "Invalid color '{}': expected #rrggbb or #rgb",
            value
        ))
    };

    let hex = value.strip_prefix('#').ok_or_else(invalid)?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let channel = |s: &str| u8::from_str_radix(s, 16).map_err(|_| invalid());
    match hex.len() {
        6 => Ok([
            channel(hex.get(0..2).ok_or_else(invalid)?)?,
            channel(hex.get(2..4).ok_or_else(invalid)?)?,
            channel(hex.get(4..6).ok_or_else(invalid)?)?,
        ]),
        3 => {
            let mut rgb = [0u8; 3];
            for (slot, c) in rgb.iter_mut().zip(hex.chars()) {
                let nibble = c.to_digit(16).ok_or_else(invalid)? as u8;
                *slot = nibble * 17;
            }
            Ok(rgb)
        },
        _ => Err(invalid()),
    }
}

/// Configuration for a single mask-and-composite run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Foreground confidence threshold
    pub threshold: Threshold,

    /// Soft band for alpha matting (None = hard cutout)
    pub matting: Option<MattingBand>,

    /// Foreground dilation
    pub refinement: RefinementConfig,

    /// Edge feather on the final surface
    pub feather: FeatherConfig,

    /// Download format
    pub output_format: OutputFormat,

    /// Download quality tier
    pub quality: QualityTier,

    /// Backdrop behind the cutout
    #[serde(skip)]
    pub backdrop: Backdrop,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: Threshold::default(),
            matting: None,
            refinement: RefinementConfig::default(),
            feather: FeatherConfig::default(),
            output_format: OutputFormat::default(),
            quality: QualityTier::default(),
            backdrop: Backdrop::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    ///
    /// ```rust
    /// use imgly_cutout::{Backdrop, OutputFormat, PipelineConfig};
    ///
    /// let config = PipelineConfig::builder()
    ///     .threshold_percent(60)
    ///     .dilation_radius(2)
    ///     .backdrop(Backdrop::Color([255, 0, 0]))
    ///     .output_format(OutputFormat::Jpeg)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.refinement.radius, 2);
    /// ```
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Derive a pipeline configuration from the persisted settings record
    ///
    /// An image backdrop is loaded from the path stored in the settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;

        let backdrop = match settings.background_type {
            BackdropType::Transparent => Backdrop::Transparent,
            BackdropType::Color => Backdrop::Color(parse_hex_color(&settings.background_color)?),
            BackdropType::Image => {
                let reference = settings.background_image.as_deref().ok_or_else(|| {
                    CutoutError::invalid_config("Image backdrop selected without an image")
                })?;
                Backdrop::load_image(reference)?
            },
        };

        let mut builder = Self::builder()
            .threshold(Threshold::from_percent(settings.foreground_threshold)?)
            .refinement(RefinementConfig {
                strategy: settings.dilation_strategy,
                radius: settings.edge_dilation,
            })
            .feather(FeatherConfig::new(
                settings.edge_feather as f32,
                f32::from(settings.feather_opacity) / 100.0,
            ))
            .backdrop(backdrop);

        if settings.alpha_matting {
            builder = builder.matting(MattingBand {
                background: Threshold::from_percent(settings.background_threshold)?,
                foreground: Threshold::from_percent(settings.foreground_threshold)?,
            });
        }

        builder.build()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Feather radius negative or non-finite
    /// - Feather opacity outside 0.0-1.0
    /// - Matting band with background above foreground
    /// - JPEG output with a transparent backdrop
    pub fn validate(&self) -> Result<()> {
        if !self.feather.radius.is_finite() || self.feather.radius < 0.0 {
            return Err(CutoutError::config_value_error(
                "feather radius",
                self.feather.radius,
                ">= 0",
                Some(2.0),
            ));
        }

        if !(0.0..=1.0).contains(&self.feather.opacity) {
            return Err(CutoutError::config_value_error(
                "feather opacity",
                self.feather.opacity,
                "0.0-1.0",
                Some(0.5),
            ));
        }

        if let Some(band) = self.matting {
            if band.background > band.foreground {
                return Err(CutoutError::invalid_config(format!(
                    "Matting background threshold {} exceeds foreground threshold {}",
                    band.background.value(),
                    band.foreground.value()
                )));
            }
        }

        if !self.output_format.supports_transparency() && !self.backdrop.is_opaque() {
            return Err(CutoutError::invalid_config(
                "JPEG output requires an opaque (color or image) backdrop",
            ));
        }

        Ok(())
    }
}

/// Builder for `PipelineConfig`
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    threshold_percent: Option<u8>,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.config.threshold = threshold;
        self.threshold_percent = None;
        self
    }

    /// Set the threshold from a 0-100 percentage, checked at `build()`
    #[must_use]
    pub fn threshold_percent(mut self, percent: u8) -> Self {
        self.threshold_percent = Some(percent);
        self
    }

    #[must_use]
    pub fn matting(mut self, band: MattingBand) -> Self {
        self.config.matting = Some(band);
        self
    }

    #[must_use]
    pub fn refinement(mut self, refinement: RefinementConfig) -> Self {
        self.config.refinement = refinement;
        self
    }

    #[must_use]
    pub fn dilation_strategy(mut self, strategy: DilationStrategy) -> Self {
        self.config.refinement.strategy = strategy;
        self
    }

    #[must_use]
    pub fn dilation_radius(mut self, radius: u32) -> Self {
        self.config.refinement.radius = radius;
        self
    }

    #[must_use]
    pub fn feather(mut self, feather: FeatherConfig) -> Self {
        self.config.feather = feather;
        self
    }

    #[must_use]
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    #[must_use]
    pub fn quality(mut self, quality: QualityTier) -> Self {
        self.config.quality = quality;
        self
    }

    #[must_use]
    pub fn backdrop(mut self, backdrop: Backdrop) -> Self {
        self.config.backdrop = backdrop;
        self
    }

    /// Build and validate the configuration
    pub fn build(mut self) -> Result<PipelineConfig> {
        if let Some(percent) = self.threshold_percent {
            self.config.threshold = Threshold::from_percent(percent)?;
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
