//! Inference engine backends
//!
//! The Tract backend runs ONNX models in pure Rust.

#[cfg(feature = "tract")]
pub mod tract;

#[cfg(feature = "tract")]
pub use self::tract::{TractBackend, TractModelLoader};
