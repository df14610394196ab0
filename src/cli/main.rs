//! Cutout CLI tool
//!
//! Command-line interface for cutting subjects out of images, editing the
//! settings record and cleaning up the upload store.

use super::config::CliConfigBuilder;
use crate::{
    config::{OutputFormat, PipelineConfig},
    download::ModelFetcher,
    segmentation::SegmentationAdapter,
    session::CutoutSession,
    settings::SettingsStore,
    tracing_config::{init_cli_tracing, spans, TracingFormat},
    upload::{UploadPolicy, UploadService},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use instant::Instant;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Background cutout CLI tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "imgly-cutout")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (-v: DEBUG for this crate, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console, global = true)]
    pub log_format: CliLogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Remove the background from images
    Cut(CutArgs),
    /// Show or update the settings record
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Delete stored uploads older than a maximum age
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct CutArgs {
    /// Input image files or directories
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file (single input) or directory (batch processing)
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    /// Segmentation model
    #[arg(short, long, value_enum, default_value_t = crate::models::ModelChoice::Isnet)]
    pub model: crate::models::ModelChoice,

    /// Local ONNX model file, overrides --model
    #[arg(long, value_name = "PATH")]
    pub model_path: Option<PathBuf>,

    /// Use custom model cache directory
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Take pipeline parameters from a settings file instead of flags
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Foreground threshold (0-100)
    #[arg(short, long, default_value_t = 50)]
    pub threshold: u8,

    /// Soften edges between the background and foreground thresholds
    #[arg(long)]
    pub alpha_matting: bool,

    /// Background threshold for alpha matting (0-100)
    #[arg(long, default_value_t = 10)]
    pub background_threshold: u8,

    /// Grow the foreground by this many pixels
    #[arg(long, default_value_t = 0)]
    pub dilate: u32,

    /// How the foreground is grown
    #[arg(long, value_enum, default_value_t = CliDilationStrategy::Neighbor)]
    pub dilation_strategy: CliDilationStrategy,

    /// Feather radius in pixels
    #[arg(long, default_value_t = 0)]
    pub feather: u32,

    /// Feather opacity (0-100)
    #[arg(long, default_value_t = 50)]
    pub feather_opacity: u8,

    /// Backdrop: "transparent", a hex color like "#ffffff", or an image path
    #[arg(short, long, default_value = "transparent")]
    pub backdrop: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = CliOutputFormat::Png)]
    pub format: CliOutputFormat,

    /// Output quality tier
    #[arg(short, long, value_enum, default_value_t = CliQuality::High)]
    pub quality: CliQuality,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Pattern for batch processing (e.g., "*.jpg")
    #[arg(long)]
    pub pattern: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    /// Print the current record as JSON
    Show {
        /// Settings file [default: platform config dir]
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Merge a partial JSON update into the record
    Set {
        /// Partial record, e.g. '{"foregroundThreshold": 60}'
        #[arg(value_name = "JSON")]
        patch: String,

        /// Settings file [default: platform config dir]
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Upload directory [default: system temp upload dir]
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Delete files older than this many seconds
    #[arg(long, default_value_t = 3600)]
    pub max_age_secs: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliOutputFormat {
    Png,
    Jpeg,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliQuality {
    Low,
    Medium,
    High,
    Maximum,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliDilationStrategy {
    /// Grow one pixel ring per iteration
    Neighbor,
    /// Blur then re-threshold
    Blur,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => Self::Console,
            CliLogFormat::Compact => Self::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => Self::Json,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    let session_id =
        init_cli_tracing(cli.verbose, cli.log_format.into()).context("Failed to initialize tracing")?;

    let command_name = match &cli.command {
        Command::Cut(_) => "cut",
        Command::Settings { .. } => "settings",
        Command::Cleanup(_) => "cleanup",
    };
    let span = spans::session(&session_id, command_name);

    async {
        match &cli.command {
            Command::Cut(args) => run_cut(args).await,
            Command::Settings { action } => run_settings(action),
            Command::Cleanup(args) => run_cleanup(args).await,
        }
    }
    .instrument(span)
    .await
}

async fn run_cut(args: &CutArgs) -> Result<()> {
    CliConfigBuilder::validate_cli(args).context("Invalid CLI arguments")?;
    let config = CliConfigBuilder::from_cli(args).context("Failed to build configuration")?;
    let model_spec = CliConfigBuilder::model_spec(args)?;

    let files = collect_inputs(args)?;
    if files.is_empty() {
        anyhow::bail!("No image files found in the given inputs");
    }

    info!("Starting cutout CLI");
    info!(files = files.len(), model = %model_spec.source.display_name(), "Inputs collected");

    let fetcher = match &args.cache_dir {
        Some(dir) => ModelFetcher::with_cache_dir(dir),
        None => ModelFetcher::new(),
    }
    .context("Failed to set up model cache")?
    .with_progress(true);

    let adapter = Arc::new(create_adapter(model_spec, fetcher)?);
    adapter
        .initialize()
        .await
        .context("Failed to initialize segmentation model")?;

    let session = CutoutSession::new(adapter);
    let start_time = Instant::now();
    let (processed, failed) = process_files(args, &session, &config, &files)
        .instrument(spans::batch_processing(files.len()))
        .await;

    info!(
        "Processed {} image(s) in {:.2}s",
        processed,
        start_time.elapsed().as_secs_f64()
    );

    if failed > 0 {
        anyhow::bail!("{} of {} input(s) failed", failed, files.len());
    }
    Ok(())
}

#[cfg(feature = "tract")]
fn create_adapter(spec: crate::models::ModelSpec, fetcher: ModelFetcher) -> Result<SegmentationAdapter> {
    Ok(SegmentationAdapter::tract(spec, fetcher))
}

#[cfg(not(feature = "tract"))]
fn create_adapter(_spec: crate::models::ModelSpec, _fetcher: ModelFetcher) -> Result<SegmentationAdapter> {
    anyhow::bail!("Built without an inference backend; enable the `tract` feature")
}

async fn process_files(
    args: &CutArgs,
    session: &CutoutSession,
    config: &PipelineConfig,
    files: &[PathBuf],
) -> (usize, usize) {
    let progress = (files.len() > 1).then(|| {
        let bar = ProgressBar::new(files.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar
    });

    let mut processed = 0;
    let mut failed = 0;
    for file in files {
        if let Some(bar) = &progress {
            bar.set_message(file.display().to_string());
        }

        let output_path = output_path_for(file, args.output.as_deref(), files.len() > 1, config.output_format);
        let task = process_file(session, config, file, &output_path)
            .instrument(spans::file_processing(file));
        match task.await {
            Ok(()) => {
                processed += 1;
                info!(input = %file.display(), output = %output_path.display(), "Saved cutout");
            },
            Err(e) => {
                failed += 1;
                error!(input = %file.display(), "Failed to process: {:#}", e);
            },
        }

        if let Some(bar) = &progress {
            bar.inc(1);
        }
    }

    if let Some(bar) = progress {
        bar.finish_with_message("done");
    }
    (processed, failed)
}

async fn process_file(
    session: &CutoutSession,
    config: &PipelineConfig,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let token = session.load_bytes(&bytes).context("Failed to decode image")?;
    let result = session
        .process(token, config)
        .await
        .context("Cutout pipeline failed")?
        .into_result()
        .context("Run was superseded")?;
    debug!(timings = %result.timings.summary(), "Pipeline finished");

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
    }
    let encoded = session
        .download(config.output_format, config.quality)
        .context("Failed to encode result")?;
    std::fs::write(output, encoded).with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}

fn run_settings(action: &SettingsAction) -> Result<()> {
    let (file, patch) = match action {
        SettingsAction::Show { file } => (file, None),
        SettingsAction::Set { patch, file } => (file, Some(patch)),
    };
    let path = match file {
        Some(path) => path.clone(),
        None => default_settings_path()?,
    };

    let store = SettingsStore::open(&path)
        .with_context(|| format!("Failed to open settings file {}", path.display()))?;
    let settings = match patch {
        Some(body) => store.update_json(body).context("Settings update rejected")?,
        None => store.get(),
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn default_settings_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Cannot determine a config directory; pass --file")?;
    Ok(base.join("imgly-cutout").join("settings.json"))
}

async fn run_cleanup(args: &CleanupArgs) -> Result<()> {
    let service = match &args.dir {
        Some(dir) => UploadService::new(dir, UploadPolicy::default()),
        None => UploadService::in_temp_dir(UploadPolicy::default()),
    }
    .context("Failed to open upload directory")?;

    let report = service
        .cleanup(Duration::from_secs(args.max_age_secs))
        .await
        .context("Cleanup failed")?;

    if report.removed == 0 {
        warn!(dir = %service.root().display(), "Nothing to clean up");
    }
    println!(
        "Removed {} file(s), kept {} in {}",
        report.removed,
        report.retained,
        service.root().display()
    );
    Ok(())
}

/// Expand files and directories into the list of images to process
fn collect_inputs(args: &CutArgs) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in &args.inputs {
        if input.is_dir() {
            let found = find_image_files(input, args.recursive, args.pattern.as_deref())
                .with_context(|| format!("Failed to scan {}", input.display()))?;
            if found.is_empty() {
                warn!(dir = %input.display(), "No images found");
            }
            files.extend(found);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            anyhow::bail!("Input not found: {}", input.display());
        }
    }
    Ok(files)
}

/// Find image files in a directory
fn find_image_files(dir: &Path, recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if recursive {
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let path = entry.path();
                if is_image_file(path) && matches_pattern(path, pattern) {
                    files.push(path.to_path_buf());
                }
            }
        }
    } else {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let path = entry.path();
                if is_image_file(&path) && matches_pattern(&path, pattern) {
                    files.push(path);
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Check if the file name matches a glob pattern
fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    match pattern {
        Some(pat) => {
            if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                glob::Pattern::new(pat)
                    .map(|p| p.matches(filename))
                    .unwrap_or(false)
            } else {
                false
            }
        },
        None => true,
    }
}

/// Output location for one input
///
/// A lone input with `--output` writes exactly there; otherwise `--output`
/// names a directory; without it results land next to the input.
fn output_path_for(input: &Path, output: Option<&Path>, batch: bool, format: OutputFormat) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let file_name = format!("{}_cutout.{}", stem, format.extension());

    match output {
        Some(path) if !batch && !path.is_dir() => path.to_path_buf(),
        Some(dir) => dir.join(file_name),
        None => input.parent().unwrap_or(Path::new(".")).join(file_name),
    }
}
