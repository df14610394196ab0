//! Model fetching into the local cache
//!
//! Remote models are streamed into a temporary file inside the cache
//! directory, optionally verified against a SHA-256 digest, and atomically
//! renamed into place. A model that is already cached is never fetched again.

use crate::error::{CutoutError, Result};
use crate::models::{ModelSource, ModelSpec};
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

/// Environment variable overriding the cache location
pub const CACHE_DIR_ENV: &str = "IMGLY_CUTOUT_CACHE_DIR";

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {},
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {
                let _ = len;
            },
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {
                let _ = pos;
            },
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {},
        }
    }

    fn for_download(show_progress: bool) -> Self {
        #[cfg(feature = "cli")]
        {
            if show_progress {
                let pb = ProgressBar::new(0);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                return Self::Indicatif(pb);
            }
        }
        let _ = show_progress;
        Self::NoOp
    }
}

/// Resolve the model cache directory
///
/// `IMGLY_CUTOUT_CACHE_DIR` wins, otherwise the platform cache directory.
pub fn default_cache_dir() -> Result<PathBuf> {
    if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
        return Ok(PathBuf::from(cache_override).join("models"));
    }

    Ok(dirs::cache_dir()
        .ok_or_else(|| {
            CutoutError::invalid_config(format!(
                "Failed to determine cache directory. Set {} environment variable.",
                CACHE_DIR_ENV
            ))
        })?
        .join("imgly-cutout")
        .join("models"))
}

/// Derive a cache-safe file name from a model URL
///
/// `https://huggingface.co/imgly/isnet-general-onnx/resolve/main/onnx/model.onnx`
/// becomes `huggingface.co--imgly--isnet-general-onnx--resolve--main--onnx--model.onnx`.
#[must_use]
pub fn url_to_file_name(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    trimmed
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.chars()
                .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("--")
}

/// Compute the SHA-256 digest of a file as lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| CutoutError::file_io_error("open file for verification", path, &e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| CutoutError::file_io_error("read file for verification", path, &e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a file against an optional expected digest
pub fn verify_file_integrity(path: &Path, expected_hash: Option<&str>) -> Result<bool> {
    let Some(expected) = expected_hash else {
        return Ok(true);
    };

    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(true)
    } else {
        warn!(
            path = %path.display(),
            expected,
            actual = %actual,
            "File integrity check failed"
        );
        Ok(false)
    }
}

/// Fetches model weights into the local cache
#[derive(Debug, Clone)]
pub struct ModelFetcher {
    client: Client,
    cache_dir: PathBuf,
    show_progress: bool,
}

impl ModelFetcher {
    /// Fetcher using the default cache directory
    ///
    /// # Errors
    /// - Failed to create HTTP client
    /// - Cache directory cannot be determined
    pub fn new() -> Result<Self> {
        Self::with_cache_dir(default_cache_dir()?)
    }

    /// Fetcher using a custom cache directory
    pub fn with_cache_dir<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| CutoutError::network_error("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            show_progress: false,
        })
    }

    /// Show a progress bar while downloading (CLI builds only)
    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache location for a remote model URL
    #[must_use]
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(url_to_file_name(url))
    }

    /// Resolve a model specification to a local ONNX file
    ///
    /// # Errors
    /// - External file missing
    /// - Network errors during download
    /// - Digest mismatch after download
    #[instrument(skip(self, spec), fields(model = %spec.source.display_name()))]
    pub async fn resolve(&self, spec: &ModelSpec) -> Result<PathBuf> {
        match &spec.source {
            ModelSource::External(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(CutoutError::model_unavailable(format!(
                        "Model file not found: {}",
                        path.display()
                    )))
                }
            },
            ModelSource::Remote { url, sha256 } => self.fetch(url, sha256.as_deref()).await,
        }
    }

    /// Fetch a remote model unless it is already cached
    pub async fn fetch(&self, url: &str, sha256: Option<&str>) -> Result<PathBuf> {
        let final_path = self.cached_path(url);

        if final_path.is_file() {
            if verify_file_integrity(&final_path, sha256)? {
                debug!(path = %final_path.display(), "Model already cached");
                return Ok(final_path);
            }
            warn!("Cached model failed verification, downloading again");
        }

        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            CutoutError::file_io_error("create cache directory", &self.cache_dir, &e)
        })?;

        // Removed automatically unless persisted
        let temp_path = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.cache_dir)
            .map_err(|e| {
                CutoutError::file_io_error("create temporary download file", &self.cache_dir, &e)
            })?
            .into_temp_path();

        let progress = ProgressIndicator::for_download(self.show_progress);
        progress.set_message(format!("Downloading {}", url.rsplit('/').next().unwrap_or(url)));

        if let Err(e) = self.download_file(url, &temp_path, &progress).await {
            progress.finish_with_message("Download failed".to_string());
            return Err(e);
        }

        if !verify_file_integrity(&temp_path, sha256)? {
            progress.finish_with_message("Verification failed".to_string());
            return Err(CutoutError::model_unavailable(format!(
                "Downloaded model from {} does not match the expected SHA-256 digest",
                url
            )));
        }

        temp_path.persist(&final_path).map_err(|e| {
            CutoutError::file_io_error("move downloaded model to cache", &final_path, &e.error)
        })?;

        progress.finish_with_message("Downloaded".to_string());
        info!(path = %final_path.display(), "Model downloaded");
        Ok(final_path)
    }

    /// Stream a single file to disk with progress reporting
    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<()> {
        debug!(url, path = %local_path.display(), "Downloading");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CutoutError::network_error(format!("Failed to download {}", url), e))?;

        if !response.status().is_success() {
            return Err(CutoutError::network_error(
                format!("Request for {} failed", url),
                response.status(),
            ));
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            progress.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| CutoutError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 8192];

        loop {
            let bytes_read = stream
                .read(&mut buffer)
                .await
                .map_err(|e| CutoutError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| CutoutError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;
            progress.set_position(downloaded);
        }

        file.flush()
            .await
            .map_err(|e| CutoutError::file_io_error("flush file", local_path, &e))?;

        debug!(bytes = downloaded, "Download complete");
        Ok(())
    }
}
