//! Model choices, sources and preprocessing metadata

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const ISNET_REPOSITORY: &str = "https://huggingface.co/imgly/isnet-general-onnx/resolve/main";

/// Segmentation model selectable from the settings record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ModelChoice {
    /// Full precision `ISNet`
    #[default]
    Isnet,
    /// Half precision `ISNet`, smaller download
    IsnetFp16,
    /// 8-bit quantized `ISNet`, smallest and fastest
    IsnetQuint8,
}

impl ModelChoice {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isnet => "isnet",
            Self::IsnetFp16 => "isnet_fp16",
            Self::IsnetQuint8 => "isnet_quint8",
        }
    }

    #[must_use]
    pub fn precision(self) -> &'static str {
        match self {
            Self::Isnet => "fp32",
            Self::IsnetFp16 => "fp16",
            Self::IsnetQuint8 => "quint8",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Isnet => "model.onnx",
            Self::IsnetFp16 => "model_fp16.onnx",
            Self::IsnetQuint8 => "model_quantized.onnx",
        }
    }

    /// Remote location of the model weights
    #[must_use]
    pub fn url(self) -> String {
        format!("{}/onnx/{}", ISNET_REPOSITORY, self.file_name())
    }
}

impl std::fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelChoice {
    type Err = crate::error::CutoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isnet" => Ok(Self::Isnet),
            "isnet_fp16" => Ok(Self::IsnetFp16),
            "isnet_quint8" => Ok(Self::IsnetQuint8),
            other => Err(crate::error::CutoutError::invalid_config(format!(
                "Unknown model '{}': expected isnet, isnet_fp16 or isnet_quint8",
                other
            ))),
        }
    }
}

/// Where the model weights come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    /// ONNX file already on disk
    External(PathBuf),
    /// ONNX file fetched once into the model cache
    Remote {
        url: String,
        sha256: Option<String>,
    },
}

impl ModelSource {
    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::External(path) => format!(
                "external:{}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ),
            Self::Remote { url, .. } => {
                format!("remote:{}", url.rsplit('/').next().unwrap_or(url))
            },
        }
    }
}

/// Model input preprocessing parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Square model input size
    pub target_size: [u32; 2],
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            target_size: [1024, 1024],
            normalization_mean: [0.5, 0.5, 0.5],
            normalization_std: [1.0, 1.0, 1.0],
        }
    }
}

/// Complete model specification: source plus preprocessing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub precision: String,
    pub source: ModelSource,
    pub preprocessing: PreprocessingConfig,
}

impl ModelSpec {
    /// Remote `ISNet` weights for a settings model choice
    #[must_use]
    pub fn for_choice(choice: ModelChoice) -> Self {
        Self {
            name: choice.as_str().to_string(),
            precision: choice.precision().to_string(),
            source: ModelSource::Remote {
                url: choice.url(),
                sha256: None,
            },
            preprocessing: PreprocessingConfig::default(),
        }
    }

    /// Local ONNX file with default `ISNet` preprocessing
    #[must_use]
    pub fn external<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map_or_else(|| "external".to_string(), |s| s.to_string_lossy().into_owned());
        Self {
            name,
            precision: "unknown".to_string(),
            source: ModelSource::External(path),
            preprocessing: PreprocessingConfig::default(),
        }
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self::for_choice(ModelChoice::default())
    }
}

/// Model information and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub precision: String,
    pub size_bytes: usize,
    pub input_shape: (usize, usize, usize, usize), // NCHW format
    pub output_shape: (usize, usize, usize, usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_choice_names() {
        assert_eq!(ModelChoice::IsnetFp16.as_str(), "isnet_fp16");
        assert_eq!("isnet_quint8".parse::<ModelChoice>().unwrap(), ModelChoice::IsnetQuint8);
        assert!("birefnet".parse::<ModelChoice>().is_err());

        let json = serde_json::to_string(&ModelChoice::IsnetFp16).unwrap();
        assert_eq!(json, "\"isnet_fp16\"");
    }

    #[test]
    fn test_model_urls_are_distinct() {
        assert!(ModelChoice::Isnet.url().ends_with("onnx/model.onnx"));
        assert_ne!(ModelChoice::Isnet.url(), ModelChoice::IsnetFp16.url());
    }

    #[test]
    fn test_display_name() {
        let spec = ModelSpec::external("/models/custom-net.onnx");
        assert_eq!(spec.name, "custom-net");
        assert_eq!(spec.source.display_name(), "external:custom-net.onnx");

        let spec = ModelSpec::for_choice(ModelChoice::Isnet);
        assert_eq!(spec.source.display_name(), "remote:model.onnx");
    }
}
