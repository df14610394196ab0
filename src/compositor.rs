//! Mask application, backdrop compositing and download encoding

use crate::config::{Backdrop, FeatherConfig, OutputFormat, PipelineConfig, QualityTier};
use crate::error::{CutoutError, Result};
use crate::mask::MaskBuilder;
use crate::refine::MaskRefiner;
use crate::types::{CompositeResult, Mask, ProcessingTimings, SegmentationLabels, SourceImage};
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::{imageops, ExtendedColorType, ImageEncoder, Rgba, RgbImage, RgbaImage};
use instant::Instant;
use std::path::Path;
use tracing::{debug, instrument, span, Level};

/// Composites cutouts over backdrops and encodes the result
#[derive(Debug, Clone, Copy, Default)]
pub struct Compositor;

impl Compositor {
    /// Run mask construction, refinement and compositing for one image
    #[instrument(skip_all, fields(width = source.width(), height = source.height()))]
    pub fn render(
        source: &SourceImage,
        labels: &SegmentationLabels,
        config: &PipelineConfig,
    ) -> Result<CompositeResult> {
        let total_start = Instant::now();
        let mut timings = ProcessingTimings::default();

        let mask_start = Instant::now();
        let mut mask = match config.matting {
            Some(band) => MaskBuilder::build_matted(labels, band)?,
            None => MaskBuilder::build(labels)?,
        };
        timings.mask_ms = mask_start.elapsed().as_millis() as u64;

        let refine_start = Instant::now();
        MaskRefiner::refine(&mut mask, &config.refinement)?;
        timings.refine_ms = refine_start.elapsed().as_millis() as u64;

        let composite_start = Instant::now();
        let mut result = Self::composite(source, &mask, &config.backdrop, &config.feather)?;
        timings.composite_ms = composite_start.elapsed().as_millis() as u64;
        timings.total_ms = total_start.elapsed().as_millis() as u64;

        result.timings = timings;
        Ok(result)
    }

    /// Apply `mask` to `source`, draw over `backdrop`, then feather
    ///
    /// # Errors
    /// - `InvalidInput` when mask and source dimensions differ
    pub fn composite(
        source: &SourceImage,
        mask: &Mask,
        backdrop: &Backdrop,
        feather: &FeatherConfig,
    ) -> Result<CompositeResult> {
        if mask.dimensions() != source.dimensions() {
            return Err(CutoutError::invalid_input(format!(
                "Mask {}x{} does not match image {}x{}",
                mask.width(),
                mask.height(),
                source.width(),
                source.height()
            )));
        }

        let _span = span!(Level::DEBUG, "composite", backdrop = backdrop_name(backdrop)).entered();

        let cutout = Self::apply_mask(source.as_rgba(), mask);
        let (width, height) = cutout.dimensions();

        let surface = match backdrop {
            Backdrop::Transparent => cutout,
            Backdrop::Color([r, g, b]) => {
                let mut canvas = RgbaImage::from_pixel(width, height, Rgba([*r, *g, *b, 255]));
                Self::draw_over(&mut canvas, &cutout);
                canvas
            },
            Backdrop::Image(image) => {
                let mut canvas = Self::cover(image, (width, height))?;
                Self::draw_over(&mut canvas, &cutout);
                canvas
            },
        };

        let surface = MaskRefiner::feather(&surface, feather);
        Ok(CompositeResult::new(surface, backdrop.is_opaque()))
    }

    /// Cutout: alpha scaled by mask, zero-mask pixels fully transparent
    fn apply_mask(source: &RgbaImage, mask: &Mask) -> RgbaImage {
        let mut out = RgbaImage::new(source.width(), source.height());
        for ((dst, src), &m) in out.pixels_mut().zip(source.pixels()).zip(mask.data()) {
            *dst = match m {
                0 => Rgba([0, 0, 0, 0]),
                255 => *src,
                _ => {
                    let alpha = (u32::from(src[3]) * u32::from(m) + 127) / 255;
                    Rgba([src[0], src[1], src[2], alpha as u8])
                },
            };
        }
        out
    }

    /// Source-over blend of `top` onto `canvas` (same dimensions)
    fn draw_over(canvas: &mut RgbaImage, top: &RgbaImage) {
        for (dst, src) in canvas.pixels_mut().zip(top.pixels()) {
            *dst = blend_over(*dst, *src);
        }
    }

    /// Scale `backdrop` preserving aspect ratio to cover `dimensions`, then center crop
    pub fn cover(backdrop: &RgbaImage, (width, height): (u32, u32)) -> Result<RgbaImage> {
        let (bw, bh) = backdrop.dimensions();
        if bw == 0 || bh == 0 {
            return Err(CutoutError::invalid_input("Backdrop image has no pixels"));
        }

        let scale = (f64::from(width) / f64::from(bw)).max(f64::from(height) / f64::from(bh));
        let scaled_w = ((f64::from(bw) * scale).ceil() as u32).max(width);
        let scaled_h = ((f64::from(bh) * scale).ceil() as u32).max(height);

        let resized = if (scaled_w, scaled_h) == (bw, bh) {
            backdrop.clone()
        } else {
            imageops::resize(backdrop, scaled_w, scaled_h, imageops::FilterType::Triangle)
        };

        let x = (scaled_w - width) / 2;
        let y = (scaled_h - height) / 2;
        debug!(scaled_w, scaled_h, x, y, "Cover-fit backdrop");
        Ok(imageops::crop_imm(&resized, x, y, width, height).to_image())
    }

    /// Encode a result for download
    ///
    /// # Errors
    /// - `InvalidConfig` for JPEG with a transparent backdrop
    /// - Encoder failures
    #[instrument(skip(result), fields(width = result.dimensions().0, height = result.dimensions().1))]
    pub fn encode(result: &CompositeResult, format: OutputFormat, quality: QualityTier) -> Result<Vec<u8>> {
        let (width, height) = result.dimensions();
        let mut buffer = Vec::new();

        match format {
            OutputFormat::Png => {
                let compression = match quality {
                    QualityTier::Low => CompressionType::Fast,
                    QualityTier::Medium => CompressionType::Default,
                    QualityTier::High | QualityTier::Maximum => CompressionType::Best,
                };
                PngEncoder::new_with_quality(&mut buffer, compression, PngFilter::Adaptive).write_image(
                    result.image().as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgba8,
                )?;
            },
            OutputFormat::Jpeg => {
                if !result.has_opaque_backdrop() {
                    return Err(CutoutError::invalid_config(
                        "JPEG output requires an opaque (color or image) backdrop",
                    ));
                }
                let rgb: RgbImage = result.image().convert();
                JpegEncoder::new_with_quality(&mut buffer, quality.jpeg_quality()).write_image(
                    rgb.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgb8,
                )?;
            },
        }

        debug!(bytes = buffer.len(), %format, "Encoded result");
        Ok(buffer)
    }

    /// Encode and write to `path`
    pub fn save<P: AsRef<Path>>(
        result: &CompositeResult,
        path: P,
        format: OutputFormat,
        quality: QualityTier,
    ) -> Result<()> {
        let path = path.as_ref();
        let bytes = Self::encode(result, format, quality)?;
        std::fs::write(path, bytes).map_err(|e| CutoutError::file_io_error("write output", path, &e))
    }
}

fn backdrop_name(backdrop: &Backdrop) -> &'static str {
    match backdrop {
        Backdrop::Transparent => "transparent",
        Backdrop::Color(_) => "color",
        Backdrop::Image(_) => "image",
    }
}

/// Integer source-over with exact results at alpha 0 and 255
fn blend_over(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let sa = u32::from(src[3]);
    match sa {
        0 => return dst,
        255 => return src,
        _ => {},
    }

    let da = u32::from(dst[3]);
    // Alpha scaled by 255
    let out_a = sa * 255 + da * (255 - sa);
    if out_a == 0 {
        return Rgba([0, 0, 0, 0]);
    }

    let channel = |s: u8, d: u8| {
        let numerator = u32::from(s) * sa * 255 + u32::from(d) * da * (255 - sa);
        ((numerator + out_a / 2) / out_a) as u8
    };

    Rgba([
        channel(src[0], dst[0]),
        channel(src[1], dst[1]),
        channel(src[2], dst[2]),
        ((out_a + 127) / 255) as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn source(width: u32, height: u32, color: [u8; 4]) -> SourceImage {
        SourceImage::from_rgba(RgbaImage::from_pixel(width, height, Rgba(color))).unwrap()
    }

    #[test]
    fn test_full_mask_over_color_equals_source() {
        let src = source(100, 100, [12, 200, 34, 255]);
        let mask = Mask::filled((100, 100), 255);
        let result =
            Compositor::composite(&src, &mask, &Backdrop::Color([255, 0, 0]), &FeatherConfig::default())
                .unwrap();
        assert_eq!(result.image(), src.as_rgba());
        assert!(result.has_opaque_backdrop());
    }

    #[test]
    fn test_empty_mask_transparent_everywhere() {
        let src = source(100, 100, [12, 200, 34, 255]);
        let mask = Mask::filled((100, 100), 0);
        let result =
            Compositor::composite(&src, &mask, &Backdrop::Transparent, &FeatherConfig::default()).unwrap();
        assert!(result.image().pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_empty_mask_shows_backdrop() {
        let src = source(4, 4, [12, 200, 34, 255]);
        let mask = Mask::filled((4, 4), 0);
        let result =
            Compositor::composite(&src, &mask, &Backdrop::Color([1, 2, 3]), &FeatherConfig::default()).unwrap();
        assert!(result.image().pixels().all(|p| p.0 == [1, 2, 3, 255]));
    }

    #[test]
    fn test_partial_mask_scales_alpha() {
        let src = source(1, 1, [100, 100, 100, 200]);
        let mask = Mask::new(vec![128], (1, 1)).unwrap();
        let result =
            Compositor::composite(&src, &mask, &Backdrop::Transparent, &FeatherConfig::default()).unwrap();
        assert_eq!(result.image().get_pixel(0, 0)[3], 100);
    }

    #[test]
    fn test_half_alpha_blend() {
        let out = blend_over(Rgba([0, 0, 0, 255]), Rgba([255, 255, 255, 128]));
        assert_eq!(out[3], 255);
        assert_eq!(out[0], 128);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let src = source(4, 4, [0, 0, 0, 255]);
        let mask = Mask::filled((4, 5), 255);
        let result = Compositor::composite(&src, &mask, &Backdrop::Transparent, &FeatherConfig::default());
        assert!(matches!(result, Err(CutoutError::InvalidInput(_))));
    }

    #[test]
    fn test_cover_keeps_output_dimensions() {
        let wide = RgbaImage::from_pixel(300, 100, Rgba([9, 9, 9, 255]));
        for dims in [(1, 1), (50, 200), (640, 480)] {
            let covered = Compositor::cover(&wide, dims).unwrap();
            assert_eq!(covered.dimensions(), dims);
        }
    }

    #[test]
    fn test_image_backdrop_center_crop() {
        // Left third red, middle green, right third blue
        let mut backdrop = RgbaImage::new(30, 10);
        for (x, _, p) in backdrop.enumerate_pixels_mut() {
            *p = match x / 10 {
                0 => Rgba([255, 0, 0, 255]),
                1 => Rgba([0, 255, 0, 255]),
                _ => Rgba([0, 0, 255, 255]),
            };
        }

        let src = source(10, 10, [0, 0, 0, 255]);
        let mask = Mask::filled((10, 10), 0);
        let result = Compositor::composite(
            &src,
            &mask,
            &Backdrop::Image(Arc::new(backdrop)),
            &FeatherConfig::default(),
        )
        .unwrap();
        assert_eq!(result.image().get_pixel(5, 5).0, [0, 255, 0, 255]);
    }

    #[test]
    fn test_composite_is_deterministic() {
        let mut pixels = RgbaImage::new(16, 16);
        for (x, y, p) in pixels.enumerate_pixels_mut() {
            *p = Rgba([(x * 16) as u8, (y * 16) as u8, 7, 255]);
        }
        let src = SourceImage::from_rgba(pixels).unwrap();
        let mask = Mask::new((0..256).map(|i| (i % 256) as u8).collect(), (16, 16)).unwrap();
        let feather = FeatherConfig::new(1.5, 0.5);

        let a = Compositor::composite(&src, &mask, &Backdrop::Color([0, 0, 255]), &feather).unwrap();
        let b = Compositor::composite(&src, &mask, &Backdrop::Color([0, 0, 255]), &feather).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_formats() {
        let src = source(8, 8, [10, 20, 30, 255]);
        let mask = Mask::filled((8, 8), 255);

        let transparent =
            Compositor::composite(&src, &mask, &Backdrop::Transparent, &FeatherConfig::default()).unwrap();
        let png = Compositor::encode(&transparent, OutputFormat::Png, QualityTier::Low).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
        assert!(Compositor::encode(&transparent, OutputFormat::Jpeg, QualityTier::High).is_err());

        let opaque =
            Compositor::composite(&src, &mask, &Backdrop::Color([0, 0, 0]), &FeatherConfig::default()).unwrap();
        let jpeg = Compositor::encode(&opaque, OutputFormat::Jpeg, QualityTier::Medium).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(&decoded, transparent.image());
    }

    #[test]
    fn test_translucent_image_backdrop_is_not_jpeg_encodable() {
        let src = source(20, 20, [200, 100, 50, 255]);
        let mask = Mask::filled((20, 20), 0);
        let backdrop = Backdrop::Image(Arc::new(RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 0]))));

        let result = Compositor::composite(&src, &mask, &backdrop, &FeatherConfig::default()).unwrap();
        assert!(result.image().pixels().all(|p| p[3] == 0));
        assert!(!result.has_opaque_backdrop());
        assert!(matches!(
            Compositor::encode(&result, OutputFormat::Jpeg, QualityTier::High),
            Err(CutoutError::InvalidConfig(_))
        ));
    }
}
