//! Mask construction from segmentation labels

use crate::config::MattingBand;
use crate::error::Result;
use crate::types::{Mask, SegmentationLabels};
use tracing::{span, Level};

/// Builds grayscale masks from labels
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskBuilder;

impl MaskBuilder {
    /// Hard binary mask: 255 for foreground, 0 otherwise
    pub fn build(labels: &SegmentationLabels) -> Result<Mask> {
        let _span = span!(Level::DEBUG, "build_mask", pixels = labels.len()).entered();

        let data = labels
            .foreground()
            .iter()
            .map(|&foreground| if foreground { 255 } else { 0 })
            .collect();
        Mask::new(data, labels.dimensions())
    }

    /// Alpha-matted mask with a linear ramp inside the band
    ///
    /// Confidence at or above `band.foreground` maps to 255, at or below
    /// `band.background` to 0. Values strictly between ramp linearly. A
    /// degenerate band (both thresholds equal) is a hard cut at that value.
    pub fn build_matted(labels: &SegmentationLabels, band: MattingBand) -> Result<Mask> {
        let _span = span!(Level::DEBUG, "build_matted_mask", pixels = labels.len()).entered();

        let low = band.background.value();
        let high = band.foreground.value();
        let width = high - low;

        let data = labels
            .confidence()
            .iter()
            .map(|&c| {
                if c >= high {
                    255
                } else if c <= low {
                    0
                } else {
                    ((c - low) / width * 255.0).round().clamp(1.0, 254.0) as u8
                }
            })
            .collect();
        Mask::new(data, labels.dimensions())
    }
}
