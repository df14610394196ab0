//! Shared fakes for integration tests
//!
//! `FakeLoader` stands in for a real model so the pipeline can be exercised
//! without downloading weights. Its backend reports a configurable pattern
//! of confidences in model space.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use imgly_cutout::{
    CutoutError, InferenceBackend, ModelInfo, ModelLoader, PreprocessingConfig, Result,
    SegmentationAdapter, SourceImage,
};
use ndarray::Array4;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const MODEL_SIZE: u32 = 32;

/// Confidence layout produced by the fake model
#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    /// Same value everywhere
    Constant(f32),
    /// 1.0 inside the centered half of the input square, 0.0 outside
    CenterSquare,
}

pub struct FakeBackend {
    pattern: Pattern,
    inferences: Arc<AtomicUsize>,
}

impl InferenceBackend for FakeBackend {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.inferences.fetch_add(1, Ordering::SeqCst);
        let shape = input.shape();
        let (height, width) = (shape[2], shape[3]);
        let output = match self.pattern {
            Pattern::Constant(value) => Array4::from_elem((1, 1, height, width), value),
            Pattern::CenterSquare => Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
                let inside = |v: usize, len: usize| v >= len / 4 && v < len * 3 / 4;
                if inside(x, width) && inside(y, height) {
                    1.0
                } else {
                    0.0
                }
            }),
        };
        Ok(output)
    }

    fn preprocessing_config(&self) -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: [MODEL_SIZE, MODEL_SIZE],
            ..PreprocessingConfig::default()
        }
    }

    fn model_info(&self) -> ModelInfo {
        let size = MODEL_SIZE as usize;
        ModelInfo {
            name: "fake".to_string(),
            precision: "fp32".to_string(),
            size_bytes: 0,
            input_shape: (1, 3, size, size),
            output_shape: (1, 1, size, size),
        }
    }
}

/// Loader with call counting, optional failures and an optional gate
pub struct FakeLoader {
    pattern: Pattern,
    loads: AtomicUsize,
    fail_first: usize,
    gate: Option<Semaphore>,
    pub inferences: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            loads: AtomicUsize::new(0),
            fail_first: 0,
            gate: None,
            inferences: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the first `count` loads with `ModelUnavailable`
    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = count;
        self
    }

    /// Block every load until `release` is called
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn inferences(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(&self) -> Result<Box<dyn InferenceBackend>> {
        let call = self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| CutoutError::model_unavailable(e.to_string()))?;
            permit.forget();
        }
        if call < self.fail_first {
            return Err(CutoutError::model_unavailable("fake weights are corrupt"));
        }
        Ok(Box::new(FakeBackend {
            pattern: self.pattern,
            inferences: Arc::clone(&self.inferences),
        }))
    }
}

pub fn adapter(loader: &Arc<FakeLoader>) -> Arc<SegmentationAdapter> {
    Arc::new(SegmentationAdapter::new(Arc::clone(loader) as Arc<dyn ModelLoader>))
}

pub fn solid_image(width: u32, height: u32, color: [u8; 4]) -> SourceImage {
    SourceImage::from_rgba(RgbaImage::from_pixel(width, height, Rgba(color))).unwrap()
}

/// Horizontal gradient so different pixels are distinguishable
pub fn gradient_image(width: u32, height: u32) -> SourceImage {
    let pixels = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128, 255])
    });
    SourceImage::from_rgba(pixels).unwrap()
}

pub fn encode_png(image: &SourceImage) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .as_rgba()
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}
