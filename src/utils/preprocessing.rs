//! Letterbox preprocessing and its inverse
//!
//! The source is scaled to fit the square model input while preserving its
//! aspect ratio, centered on a padded canvas, and normalized into an NCHW
//! tensor. [`LetterboxTransform`] records the scale and offsets so the model
//! output can be sampled back at the source's native resolution.

use crate::{
    error::{CutoutError, Result},
    models::PreprocessingConfig,
};
use image::buffer::ConvertBuffer;
use image::{imageops, ImageBuffer, Rgb, RgbImage, RgbaImage};
use ndarray::Array4;

/// Scale and centering applied during preprocessing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub target_size: u32,
    pub source_dimensions: (u32, u32),
}

impl LetterboxTransform {
    /// Compute the transform mapping `source_dimensions` into a `target_size` square
    pub fn new(source_dimensions: (u32, u32), target_size: u32) -> Result<Self> {
        let (width, height) = source_dimensions;
        if width == 0 || height == 0 {
            return Err(CutoutError::invalid_input("Image has zero width or height"));
        }
        if target_size == 0 {
            return Err(CutoutError::invalid_config("Model input size must be positive"));
        }

        let target = target_size as f32;
        let scale = (target / width as f32).min(target / height as f32);

        let (scaled_width, scaled_height) = Self::scaled(source_dimensions, scale, target_size);

        Ok(Self {
            scale,
            offset_x: (target_size - scaled_width) / 2,
            offset_y: (target_size - scaled_height) / 2,
            target_size,
            source_dimensions,
        })
    }

    fn scaled((width, height): (u32, u32), scale: f32, target_size: u32) -> (u32, u32) {
        let w = ((width as f32 * scale).round() as u32).clamp(1, target_size);
        let h = ((height as f32 * scale).round() as u32).clamp(1, target_size);
        (w, h)
    }

    /// Size of the scaled source inside the canvas
    #[must_use]
    pub fn scaled_dimensions(&self) -> (u32, u32) {
        Self::scaled(self.source_dimensions, self.scale, self.target_size)
    }

    /// Model-space coordinate for a source pixel, `None` outside the canvas
    #[must_use]
    pub fn to_model_space(&self, x: u32, y: u32) -> Option<(u32, u32)> {
        let model_x = (x as f32 * self.scale).round() as u32 + self.offset_x;
        let model_y = (y as f32 * self.scale).round() as u32 + self.offset_y;
        (model_x < self.target_size && model_y < self.target_size).then_some((model_x, model_y))
    }

    /// Sample a `(1, 1, H, W)` model output back at native resolution
    ///
    /// Values are returned row-major, one per source pixel. Pixels mapping
    /// outside the output get 0.0.
    #[must_use]
    pub fn project(&self, output: &Array4<f32>) -> Vec<f32> {
        let (width, height) = self.source_dimensions;
        let shape = output.shape();
        let out_height = shape.get(2).copied().unwrap_or(0);
        let out_width = shape.get(3).copied().unwrap_or(0);

        // Outputs smaller or larger than the input square are rescaled
        let sx = out_width as f32 / self.target_size as f32;
        let sy = out_height as f32 / self.target_size as f32;

        let mut values = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let value = self
                    .to_model_space(x, y)
                    .and_then(|(mx, my)| {
                        let ox = ((mx as f32 * sx) as usize).min(out_width.saturating_sub(1));
                        let oy = ((my as f32 * sy) as usize).min(out_height.saturating_sub(1));
                        output.get([0, 0, oy, ox]).copied()
                    })
                    .unwrap_or(0.0);
                values.push(value);
            }
        }
        values
    }
}

/// Shared image preprocessing utilities
#[derive(Debug)]
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Padding color around the letterboxed source
    pub const PADDING: [u8; 3] = [255, 255, 255];

    /// Letterbox and normalize an image into an NCHW tensor
    pub fn preprocess(
        image: &RgbaImage,
        config: &PreprocessingConfig,
    ) -> Result<(Array4<f32>, LetterboxTransform)> {
        let target_size = config.target_size[0];
        let transform = LetterboxTransform::new(image.dimensions(), target_size)?;
        let (new_width, new_height) = transform.scaled_dimensions();

        let rgb: RgbImage = image.convert();
        let resized = imageops::resize(&rgb, new_width, new_height, imageops::FilterType::Triangle);

        let mut canvas = ImageBuffer::from_pixel(target_size, target_size, Rgb(Self::PADDING));
        imageops::overlay(
            &mut canvas,
            &resized,
            i64::from(transform.offset_x),
            i64::from(transform.offset_y),
        );

        Ok((Self::canvas_to_tensor(&canvas, config), transform))
    }

    /// Convert canvas to normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match canvas size
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for channel in 0..3 {
                let value = (f32::from(pixel[channel]) / 255.0 - config.normalization_mean[channel])
                    / config.normalization_std[channel];
                tensor[[0, channel, y as usize, x as usize]] = value;
            }
        }

        tensor
    }
}
