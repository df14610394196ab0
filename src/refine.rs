//! Mask post-processing: foreground dilation and edge feathering
//!
//! Both operations are no-ops at strength zero. Dilation mutates the mask in
//! place and never removes foreground; feathering works on the composited
//! RGBA surface.

use crate::config::{DilationStrategy, FeatherConfig, RefinementConfig};
use crate::error::Result;
use crate::types::{Mask, FOREGROUND_CUTOFF};
use image::{imageops, Rgba, Rgba32FImage, RgbaImage};
use tracing::{debug, span, Level};

/// Mask and surface refinement operations
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskRefiner;

impl MaskRefiner {
    /// Grow the foreground region according to `config`
    pub fn refine(mask: &mut Mask, config: &RefinementConfig) -> Result<()> {
        if config.is_noop() {
            return Ok(());
        }

        let _span = span!(
            Level::DEBUG,
            "refine_mask",
            strategy = ?config.strategy,
            radius = config.radius
        )
        .entered();
        let before = mask.foreground_count();

        match config.strategy {
            DilationStrategy::NeighborExpansion => Self::expand_neighbors(mask, config.radius),
            DilationStrategy::BlurThreshold => Self::blur_threshold(mask, config.radius)?,
        }

        debug!(before, after = mask.foreground_count(), "Dilated foreground");
        Ok(())
    }

    /// 4-connected growth, one ring of pixels per iteration
    pub fn expand_neighbors(mask: &mut Mask, iterations: u32) {
        let (width, height) = mask.dimensions();
        let (w, h) = (width as usize, height as usize);

        for _ in 0..iterations {
            let snapshot = mask.data().to_vec();
            let is_fg = |x: usize, y: usize| {
                snapshot
                    .get(y * w + x)
                    .is_some_and(|&v| v >= FOREGROUND_CUTOFF)
            };

            let mut changed = false;
            let data = mask.data_mut();
            for y in 0..h {
                for x in 0..w {
                    if is_fg(x, y) {
                        continue;
                    }
                    let touches = (x > 0 && is_fg(x - 1, y))
                        || (x + 1 < w && is_fg(x + 1, y))
                        || (y > 0 && is_fg(x, y - 1))
                        || (y + 1 < h && is_fg(x, y + 1));
                    if touches {
                        if let Some(value) = data.get_mut(y * w + x) {
                            *value = 255;
                            changed = true;
                        }
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Gaussian blur (sigma = `radius`) then re-threshold, unioned with the input
    ///
    /// Blurred values above the cutoff become 255; everything else keeps its
    /// original value, so the foreground never shrinks.
    pub fn blur_threshold(mask: &mut Mask, radius: u32) -> Result<()> {
        if radius == 0 {
            return Ok(());
        }

        let blurred = imageops::blur(&mask.to_image()?, radius as f32);
        for (value, blurred) in mask.data_mut().iter_mut().zip(blurred.as_raw()) {
            if *blurred > FOREGROUND_CUTOFF {
                *value = 255;
            }
        }
        Ok(())
    }

    /// Blend a blurred copy over `image` at the configured opacity
    #[must_use]
    pub fn feather(image: &RgbaImage, config: &FeatherConfig) -> RgbaImage {
        if config.is_noop() {
            return image.clone();
        }

        let _span = span!(
            Level::DEBUG,
            "feather",
            radius = config.radius,
            opacity = config.opacity
        )
        .entered();

        let opacity = config.opacity.clamp(0.0, 1.0);
        let sharp = Self::premultiply(image);
        let blurred = imageops::blur(&sharp, config.radius);

        let mut out = RgbaImage::new(image.width(), image.height());
        for ((dst, sharp), blur) in out.pixels_mut().zip(sharp.pixels()).zip(blurred.pixels()) {
            let mut mixed = [0.0f32; 4];
            for (channel, value) in mixed.iter_mut().enumerate() {
                *value = sharp[channel] + (blur[channel] - sharp[channel]) * opacity;
            }
            *dst = Self::unpremultiply(mixed);
        }
        out
    }

    /// Normalized premultiplied copy; color channels scaled by alpha
    fn premultiply(image: &RgbaImage) -> Rgba32FImage {
        let mut out = Rgba32FImage::new(image.width(), image.height());
        for (dst, src) in out.pixels_mut().zip(image.pixels()) {
            let alpha = f32::from(src[3]) / 255.0;
            *dst = Rgba([
                f32::from(src[0]) / 255.0 * alpha,
                f32::from(src[1]) / 255.0 * alpha,
                f32::from(src[2]) / 255.0 * alpha,
                alpha,
            ]);
        }
        out
    }

    fn unpremultiply([r, g, b, a]: [f32; 4]) -> Rgba<u8> {
        let alpha = (a * 255.0).round().clamp(0.0, 255.0) as u8;
        if alpha == 0 {
            return Rgba([0, 0, 0, 0]);
        }
        let channel = |c: f32| (c / a * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgba([channel(r), channel(g), channel(b), alpha])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot_mask(size: u32) -> Mask {
        let mut mask = Mask::filled((size, size), 0);
        let center = (size / 2 * size + size / 2) as usize;
        mask.data_mut()[center] = 255;
        mask
    }

    fn config(strategy: DilationStrategy, radius: u32) -> RefinementConfig {
        RefinementConfig { strategy, radius }
    }

    #[test]
    fn test_zero_strength_is_noop() {
        for strategy in [DilationStrategy::NeighborExpansion, DilationStrategy::BlurThreshold] {
            let original = dot_mask(9);
            let mut mask = original.clone();
            MaskRefiner::refine(&mut mask, &config(strategy, 0)).unwrap();
            assert_eq!(mask, original);
        }

        let image = RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 4]));
        assert_eq!(MaskRefiner::feather(&image, &FeatherConfig::default()), image);
    }

    #[test]
    fn test_neighbor_expansion_grows_diamond() {
        let mut mask = dot_mask(9);
        MaskRefiner::refine(&mut mask, &config(DilationStrategy::NeighborExpansion, 1)).unwrap();
        assert_eq!(mask.foreground_count(), 5);

        MaskRefiner::refine(&mut mask, &config(DilationStrategy::NeighborExpansion, 1)).unwrap();
        assert_eq!(mask.foreground_count(), 13);
        assert_eq!(mask.get(4, 2), 255);
        assert_eq!(mask.get(3, 3), 255);
        assert_eq!(mask.get(2, 2), 0);
    }

    #[test]
    fn test_dilation_never_shrinks() {
        // Thin line plus a soft matted edge
        let mut data = vec![0u8; 15 * 15];
        for x in 0..15 {
            data[7 * 15 + x] = 255;
        }
        data[0] = 200;
        let original = Mask::new(data, (15, 15)).unwrap();

        for strategy in [DilationStrategy::NeighborExpansion, DilationStrategy::BlurThreshold] {
            for radius in [1, 2, 3, 5, 8, 40] {
                let mut mask = original.clone();
                MaskRefiner::refine(&mut mask, &config(strategy, radius)).unwrap();
                assert!(
                    mask.foreground_count() >= original.foreground_count(),
                    "{strategy:?} radius {radius} shrank the mask"
                );
                for (after, before) in mask.data().iter().zip(original.data()) {
                    assert!(after >= before);
                }
            }
        }
    }

    #[test]
    fn test_expansion_stops_when_saturated() {
        let mut mask = dot_mask(3);
        MaskRefiner::expand_neighbors(&mut mask, 1_000);
        assert_eq!(mask.foreground_count(), 9);
    }

    #[test]
    fn test_blur_threshold_fills_gaps() {
        // Two blocks separated by a one-pixel gap
        let mut data = vec![0u8; 9 * 5];
        for y in 0..5 {
            for x in (0..4).chain(5..9) {
                data[y * 9 + x] = 255;
            }
        }
        let mut mask = Mask::new(data, (9, 5)).unwrap();
        MaskRefiner::blur_threshold(&mut mask, 1).unwrap();
        assert_eq!(mask.get(4, 2), 255);
    }

    #[test]
    fn test_feather_softens_edges() {
        let mut image = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 0]));
        for y in 0..10 {
            for x in 0..5 {
                image.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }

        let feathered = MaskRefiner::feather(&image, &FeatherConfig::new(2.0, 1.0));
        assert_eq!(feathered.dimensions(), (10, 10));
        let edge_alpha = feathered.get_pixel(5, 5)[3];
        assert!(edge_alpha > 0 && edge_alpha < 255);

        let half = MaskRefiner::feather(&image, &FeatherConfig::new(2.0, 0.5));
        let half_alpha = half.get_pixel(5, 5)[3];
        assert!(half_alpha > 0 && half_alpha < edge_alpha);
    }

    #[test]
    fn test_feather_keeps_subject_color_over_transparency() {
        let mut image = RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 0]));
        for y in 5..15 {
            for x in 5..15 {
                image.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }

        let feathered = MaskRefiner::feather(&image, &FeatherConfig::new(2.0, 1.0));
        for (x, y) in [(5, 10), (4, 10), (3, 10), (10, 5), (5, 5)] {
            let pixel = feathered.get_pixel(x, y);
            assert!(pixel[3] > 0 && pixel[3] < 255, "alpha at ({x}, {y})");
            assert!(pixel.0[..3].iter().all(|&c| c >= 254), "{pixel:?} at ({x}, {y})");
        }
        assert_eq!(*feathered.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_feather_of_opaque_surface_stays_opaque() {
        let image = RgbaImage::from_fn(12, 12, |x, _| Rgba([(x * 20) as u8, 40, 200, 255]));
        let feathered = MaskRefiner::feather(&image, &FeatherConfig::new(3.0, 0.8));
        assert!(feathered.pixels().all(|p| p[3] == 255));
    }
}
