//! Core raster types flowing through the cutout pipeline

use crate::error::{CutoutError, Result};
use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Mask value at or above which a pixel counts as foreground
pub const FOREGROUND_CUTOFF: u8 = 128;

/// Decoded RGBA source raster, immutable once loaded
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    pixels: RgbaImage,
}

impl SourceImage {
    /// Wrap an already decoded image
    pub fn new(image: &DynamicImage) -> Result<Self> {
        Self::from_rgba(image.to_rgba8())
    }

    /// Wrap an RGBA buffer; zero-sized rasters are rejected
    pub fn from_rgba(pixels: RgbaImage) -> Result<Self> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(CutoutError::invalid_input(format!(
                "Image has no pixels ({}x{})",
                pixels.width(),
                pixels.height()
            )));
        }
        Ok(Self { pixels })
    }

    /// Decode an encoded payload (PNG, JPEG, WebP)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).map_err(|e| {
            CutoutError::invalid_input(format!("Failed to decode image from bytes: {}", e))
        })?;
        Self::new(&image)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.pixels.width() as usize * self.pixels.height() as usize
    }

    #[must_use]
    pub fn as_rgba(&self) -> &RgbaImage {
        &self.pixels
    }
}

/// Foreground confidence threshold in the 0.0-1.0 range
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32")]
pub struct Threshold(f32);

impl TryFrom<f32> for Threshold {
    type Error = CutoutError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

impl Threshold {
    pub fn new(value: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&value) {
            return Err(CutoutError::config_value_error(
                "threshold",
                value,
                "0.0-1.0",
                Some(0.5),
            ));
        }
        Ok(Self(value))
    }

    /// Derive from the 0-100 UI setting
    pub fn from_percent(percent: u8) -> Result<Self> {
        if percent > 100 {
            return Err(CutoutError::config_value_error(
                "threshold percentage",
                percent,
                "0-100",
                Some(50),
            ));
        }
        Ok(Self(f32::from(percent) / 100.0))
    }

    #[must_use]
    pub fn value(self) -> f32 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(0.5)
    }
}

/// Per-pixel model output at native resolution, row-major
///
/// Produced once per source image and threshold, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationLabels {
    dimensions: (u32, u32),
    confidence: Vec<f32>,
    foreground: Vec<bool>,
    threshold: Threshold,
}

impl SegmentationLabels {
    /// Classify raw confidences against `threshold`
    pub fn from_confidence(
        dimensions: (u32, u32),
        confidence: Vec<f32>,
        threshold: Threshold,
    ) -> Result<Self> {
        let expected = dimensions.0 as usize * dimensions.1 as usize;
        if confidence.len() != expected {
            return Err(CutoutError::invalid_input(format!(
                "Label count {} does not match {}x{} image",
                confidence.len(),
                dimensions.0,
                dimensions.1
            )));
        }

        let confidence: Vec<f32> = confidence.into_iter().map(|c| c.clamp(0.0, 1.0)).collect();
        let foreground = confidence.iter().map(|&c| c >= threshold.value()).collect();

        Ok(Self {
            dimensions,
            confidence,
            foreground,
            threshold,
        })
    }

    /// Build labels from hard foreground/background flags
    pub fn from_flags(dimensions: (u32, u32), flags: &[bool]) -> Result<Self> {
        let confidence = flags.iter().map(|&f| if f { 1.0 } else { 0.0 }).collect();
        Self::from_confidence(dimensions, confidence, Threshold::default())
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.foreground.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.foreground.is_empty()
    }

    #[must_use]
    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    #[must_use]
    pub fn foreground(&self) -> &[bool] {
        &self.foreground
    }

    #[must_use]
    pub fn confidence(&self) -> &[f32] {
        &self.confidence
    }

    #[must_use]
    pub fn foreground_count(&self) -> usize {
        self.foreground.iter().filter(|&&f| f).count()
    }
}

/// Grayscale foreground membership raster (0-255), same size as the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    data: Vec<u8>,
    dimensions: (u32, u32),
}

impl Mask {
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Result<Self> {
        let expected = dimensions.0 as usize * dimensions.1 as usize;
        if data.len() != expected {
            return Err(CutoutError::invalid_input(format!(
                "Mask has {} values but {}x{} requires {}",
                data.len(),
                dimensions.0,
                dimensions.1,
                expected
            )));
        }
        Ok(Self { data, dimensions })
    }

    /// Mask with every pixel set to `value`
    #[must_use]
    pub fn filled(dimensions: (u32, u32), value: u8) -> Self {
        let len = dimensions.0 as usize * dimensions.1 as usize;
        Self {
            data: vec![value; len],
            dimensions,
        }
    }

    #[must_use]
    pub fn from_image(image: &GrayImage) -> Self {
        Self {
            data: image.as_raw().clone(),
            dimensions: image.dimensions(),
        }
    }

    pub fn to_image(&self) -> Result<GrayImage> {
        let (width, height) = self.dimensions;
        GrayImage::from_raw(width, height, self.data.clone()).ok_or_else(|| {
            CutoutError::rendering_context("Failed to create grayscale surface from mask data")
        })
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.dimensions.0
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.dimensions.1
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Value at (x, y); out-of-range coordinates read as background
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        if x >= self.dimensions.0 || y >= self.dimensions.1 {
            return 0;
        }
        let index = y as usize * self.dimensions.0 as usize + x as usize;
        self.data.get(index).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|&&v| v >= FOREGROUND_CUTOFF).count()
    }

    /// True when every value is either 0 or 255
    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.data.iter().all(|&v| v == 0 || v == 255)
    }

    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.foreground_count();
        let ratio = if total_pixels == 0 {
            0.0
        } else {
            foreground_pixels as f32 / total_pixels as f32
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels: total_pixels - foreground_pixels,
            foreground_ratio: ratio,
        }
    }
}

/// Statistics about a mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
}

/// Timing breakdown of a pipeline run, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    pub model_load_ms: u64,
    pub segmentation_ms: u64,
    pub mask_ms: u64,
    pub refine_ms: u64,
    pub composite_ms: u64,
    pub total_ms: u64,
}

impl ProcessingTimings {
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Total: {}ms | Model load: {}ms | Segmentation: {}ms | Mask: {}ms | Refine: {}ms | Composite: {}ms",
            self.total_ms,
            self.model_load_ms,
            self.segmentation_ms,
            self.mask_ms,
            self.refine_ms,
            self.composite_ms
        )
    }
}

/// Terminal output raster of a pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeResult {
    image: RgbaImage,
    opaque_backdrop: bool,
    pub timings: ProcessingTimings,
}

impl CompositeResult {
    #[must_use]
    pub fn new(image: RgbaImage, opaque_backdrop: bool) -> Self {
        Self {
            image,
            opaque_backdrop,
            timings: ProcessingTimings::default(),
        }
    }

    #[must_use]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    #[must_use]
    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Whether a color or image backdrop fills every pixel
    #[must_use]
    pub fn has_opaque_backdrop(&self) -> bool {
        self.opaque_backdrop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_threshold_deserialization_is_range_checked() {
        let threshold: Threshold = serde_json::from_str("0.25").unwrap();
        assert_eq!(threshold.value(), 0.25);
        assert!(serde_json::from_str::<Threshold>("5.0").is_err());
        assert!(serde_json::from_str::<Threshold>("-0.5").is_err());
        assert_eq!(serde_json::to_string(&threshold).unwrap(), "0.25");
    }

    #[test]
    fn test_source_image_rejects_empty() {
        assert!(SourceImage::from_rgba(RgbaImage::new(0, 10)).is_err());
        let source = SourceImage::from_rgba(RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255]))).unwrap();
        assert_eq!(source.dimensions(), (3, 2));
        assert_eq!(source.pixel_count(), 6);
    }

    #[test]
    fn test_source_image_from_garbage_bytes() {
        let err = SourceImage::from_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, CutoutError::InvalidInput(_)));
    }

    #[test]
    fn test_threshold_from_percent() {
        assert_eq!(Threshold::from_percent(50).unwrap().value(), 0.5);
        assert_eq!(Threshold::from_percent(0).unwrap().value(), 0.0);
        assert_eq!(Threshold::from_percent(100).unwrap().value(), 1.0);
        assert!(Threshold::from_percent(101).is_err());
        assert!(Threshold::new(-0.1).is_err());
    }

    #[test]
    fn test_labels_classification() {
        let threshold = Threshold::new(0.6).unwrap();
        let labels =
            SegmentationLabels::from_confidence((2, 2), vec![0.1, 0.6, 0.9, 1.4], threshold).unwrap();

        assert_eq!(labels.foreground(), &[false, true, true, true]);
        assert_eq!(labels.foreground_count(), 3);
        // Out-of-range confidences are clamped
        assert_eq!(labels.confidence()[3], 1.0);
    }

    #[test]
    fn test_labels_length_mismatch() {
        let result = SegmentationLabels::from_confidence((3, 3), vec![0.0; 4], Threshold::default());
        assert!(matches!(result, Err(CutoutError::InvalidInput(_))));
    }

    #[test]
    fn test_mask_accessors() {
        let mask = Mask::new(vec![255, 128, 0, 255], (2, 2)).unwrap();
        assert_eq!(mask.get(1, 0), 128);
        assert_eq!(mask.get(5, 5), 0);
        assert_eq!(mask.foreground_count(), 3);
        assert!(!mask.is_binary());

        let stats = mask.statistics();
        assert_eq!(stats.total_pixels, 4);
        assert_eq!(stats.background_pixels, 1);
        assert_eq!(stats.foreground_ratio, 0.75);

        assert!(Mask::new(vec![0; 3], (2, 2)).is_err());
    }

    #[test]
    fn test_mask_image_conversion() {
        let mask = Mask::filled((4, 3), 255);
        let image = mask.to_image().unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(Mask::from_image(&image), mask);
    }
}
