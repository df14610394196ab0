//! Conversion of `cut` arguments into a pipeline configuration

use crate::cli::main_impl::{CliDilationStrategy, CliOutputFormat, CliQuality, CutArgs};
use crate::{
    config::{
        parse_hex_color, Backdrop, DilationStrategy, FeatherConfig, MattingBand, OutputFormat,
        PipelineConfig, QualityTier, RefinementConfig,
    },
    models::ModelSpec,
    settings::{Settings, SettingsStore, MAX_EDGE_RADIUS},
    types::Threshold,
};
use anyhow::{Context, Result};
use std::path::Path;

/// Maps CLI flags onto library configuration types
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the pipeline configuration for a `cut` run
    ///
    /// With `--settings`, the settings record drives the pipeline and only
    /// the output flags are taken from the command line.
    pub(crate) fn from_cli(args: &CutArgs) -> Result<PipelineConfig> {
        let output_format = OutputFormat::from(args.format);
        let quality = QualityTier::from(args.quality);

        if let Some(settings) = Self::load_settings(args)? {
            let mut config = PipelineConfig::from_settings(&settings)
                .context("Settings record does not describe a valid pipeline")?;
            config.output_format = output_format;
            config.quality = quality;
            config
                .validate()
                .context("Output format is incompatible with the stored backdrop")?;
            return Ok(config);
        }

        let threshold = Threshold::from_percent(args.threshold).context("Invalid --threshold")?;

        let mut builder = PipelineConfig::builder()
            .threshold(threshold)
            .refinement(RefinementConfig {
                strategy: DilationStrategy::from(args.dilation_strategy),
                radius: args.dilate,
            })
            .feather(FeatherConfig::new(
                args.feather as f32,
                f32::from(args.feather_opacity) / 100.0,
            ))
            .backdrop(Self::parse_backdrop(&args.backdrop)?)
            .output_format(output_format)
            .quality(quality);

        if args.alpha_matting {
            builder = builder.matting(MattingBand {
                background: Threshold::from_percent(args.background_threshold)
                    .context("Invalid --background-threshold")?,
                foreground: threshold,
            });
        }

        builder.build().context("Invalid pipeline configuration")
    }

    /// Model selection: explicit path, then settings record, then `--model`
    pub(crate) fn model_spec(args: &CutArgs) -> Result<ModelSpec> {
        if let Some(path) = &args.model_path {
            return Ok(ModelSpec::external(path));
        }
        let choice = match Self::load_settings(args)? {
            Some(settings) => settings.model,
            None => args.model,
        };
        Ok(ModelSpec::for_choice(choice))
    }

    /// Reject flag combinations before any model is loaded
    pub(crate) fn validate_cli(args: &CutArgs) -> Result<()> {
        if args.inputs.is_empty() {
            anyhow::bail!("At least one input is required");
        }

        if args.threshold > 100 {
            anyhow::bail!("--threshold must be between 0 and 100, got {}", args.threshold);
        }

        if args.alpha_matting && args.background_threshold > args.threshold {
            anyhow::bail!(
                "--background-threshold ({}) must not exceed --threshold ({})",
                args.background_threshold,
                args.threshold
            );
        }

        if args.dilate > MAX_EDGE_RADIUS || args.feather > MAX_EDGE_RADIUS {
            anyhow::bail!("--dilate and --feather must be at most {}", MAX_EDGE_RADIUS);
        }

        if args.feather_opacity > 100 {
            anyhow::bail!("--feather-opacity must be between 0 and 100");
        }

        if let Some(path) = &args.model_path {
            if !path.is_file() {
                anyhow::bail!("Model file not found: {}", path.display());
            }
        }

        Ok(())
    }

    /// `transparent`, a hex color, or a path to an image
    pub(crate) fn parse_backdrop(value: &str) -> Result<Backdrop> {
        if value.eq_ignore_ascii_case("transparent") {
            return Ok(Backdrop::Transparent);
        }
        if value.starts_with('#') {
            let rgb = parse_hex_color(value).context("Invalid --backdrop color")?;
            return Ok(Backdrop::Color(rgb));
        }
        Backdrop::load_image(Path::new(value)).context("Invalid --backdrop image")
    }

    fn load_settings(args: &CutArgs) -> Result<Option<Settings>> {
        args.settings
            .as_ref()
            .map(|path| {
                SettingsStore::open(path)
                    .map(|store| store.get())
                    .with_context(|| format!("Failed to read settings from {}", path.display()))
            })
            .transpose()
    }
}

impl From<CliOutputFormat> for OutputFormat {
    fn from(format: CliOutputFormat) -> Self {
        match format {
            CliOutputFormat::Png => Self::Png,
            CliOutputFormat::Jpeg => Self::Jpeg,
        }
    }
}

impl From<CliQuality> for QualityTier {
    fn from(quality: CliQuality) -> Self {
        match quality {
            CliQuality::Low => Self::Low,
            CliQuality::Medium => Self::Medium,
            CliQuality::High => Self::High,
            CliQuality::Maximum => Self::Maximum,
        }
    }
}

impl From<CliDilationStrategy> for DilationStrategy {
    fn from(strategy: CliDilationStrategy) -> Self {
        match strategy {
            CliDilationStrategy::Neighbor => Self::NeighborExpansion,
            CliDilationStrategy::Blur => Self::BlurThreshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::main_impl::{Cli, Command};
    use clap::Parser;

    fn cut_args(extra: &[&str]) -> CutArgs {
        let mut argv = vec!["imgly-cutout", "cut", "photo.jpg"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Cut(args) => args,
            _ => panic!("expected cut subcommand"),
        }
    }

    #[test]
    fn test_cli_config_conversion() {
        let args = cut_args(&[
            "--threshold",
            "60",
            "--dilate",
            "3",
            "--dilation-strategy",
            "blur",
            "--feather",
            "2",
            "--backdrop",
            "#00ff00",
            "--format",
            "jpeg",
            "--quality",
            "low",
        ]);
        let config = CliConfigBuilder::from_cli(&args).unwrap();

        assert!((config.threshold.value() - 0.6).abs() < 1e-6);
        assert_eq!(config.refinement.radius, 3);
        assert_eq!(config.refinement.strategy, DilationStrategy::BlurThreshold);
        assert_eq!(config.feather.radius, 2.0);
        assert!((config.feather.opacity - 0.5).abs() < 1e-6);
        assert_eq!(config.backdrop, Backdrop::Color([0, 255, 0]));
        assert_eq!(config.output_format, OutputFormat::Jpeg);
        assert_eq!(config.quality, QualityTier::Low);
        assert!(config.matting.is_none());
    }

    #[test]
    fn test_cli_validation() {
        assert!(CliConfigBuilder::validate_cli(&cut_args(&[])).is_ok());
        assert!(CliConfigBuilder::validate_cli(&cut_args(&["--threshold", "150"])).is_err());
        assert!(CliConfigBuilder::validate_cli(&cut_args(&[
            "--alpha-matting",
            "--threshold",
            "20",
            "--background-threshold",
            "40"
        ]))
        .is_err());
        assert!(CliConfigBuilder::validate_cli(&cut_args(&["--dilate", "65"])).is_err());
    }

    #[test]
    fn test_jpeg_requires_opaque_backdrop() {
        let args = cut_args(&["--format", "jpeg"]);
        assert!(CliConfigBuilder::from_cli(&args).is_err());
    }

    #[test]
    fn test_parse_backdrop() {
        assert_eq!(
            CliConfigBuilder::parse_backdrop("Transparent").unwrap(),
            Backdrop::Transparent
        );
        assert_eq!(
            CliConfigBuilder::parse_backdrop("#fff").unwrap(),
            Backdrop::Color([255, 255, 255])
        );
        assert!(CliConfigBuilder::parse_backdrop("#zzzzzz").is_err());
        assert!(CliConfigBuilder::parse_backdrop("/nonexistent/backdrop.png").is_err());
    }

    #[test]
    fn test_settings_file_drives_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();
        store
            .update_json(r##"{"foregroundThreshold": 70, "edgeDilation": 4, "backgroundType": "color", "backgroundColor": "#000000"}"##)
            .unwrap();

        let settings_arg = path.to_string_lossy().to_string();
        let args = cut_args(&["--settings", &settings_arg, "--format", "jpeg", "--threshold", "10"]);
        let config = CliConfigBuilder::from_cli(&args).unwrap();

        assert!((config.threshold.value() - 0.7).abs() < 1e-6);
        assert_eq!(config.refinement.radius, 4);
        assert_eq!(config.backdrop, Backdrop::Color([0, 0, 0]));
        assert_eq!(config.output_format, OutputFormat::Jpeg);
    }

    #[test]
    fn test_model_spec_prefers_explicit_path() {
        let args = cut_args(&["--model-path", "/models/custom.onnx", "--model", "isnet-fp16"]);
        let spec = CliConfigBuilder::model_spec(&args).unwrap();
        assert!(matches!(spec.source, crate::models::ModelSource::External(_)));

        let args = cut_args(&["--model", "isnet-fp16"]);
        let spec = CliConfigBuilder::model_spec(&args).unwrap();
        assert_eq!(spec, ModelSpec::for_choice(crate::models::ModelChoice::IsnetFp16));
    }
}
