//! Temporary upload storage for the server-side fallback path
//!
//! Uploads are validated against a MIME allow-list, a size limit and the
//! file's magic bytes, then stored under a unique name. The "processed"
//! resource is a copy of the original until a real result replaces it.
//! A background task deletes stored files once they exceed a maximum age.

use crate::error::{CutoutError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Which uploads are accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    pub allowed_mime_types: Vec<String>,
    pub max_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    #[must_use]
    pub fn allows(&self, mime_type: &str) -> bool {
        self.allowed_mime_types.iter().any(|allowed| allowed == mime_type)
    }
}

/// Scheduled deletion of stale uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub max_age: Duration,
    pub interval: Duration,
}

impl CleanupPolicy {
    /// # Errors
    /// - `InvalidConfig` for a zero interval
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(CutoutError::invalid_config("Cleanup interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60 * 60),
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// References to a stored upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUpload {
    pub id: Uuid,
    /// File name of the original resource
    pub original: String,
    /// File name of the processed resource
    pub processed: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub original_path: PathBuf,
    #[serde(skip)]
    pub processed_path: PathBuf,
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub retained: usize,
}

/// Detect the MIME type of image data by examining magic bytes
#[must_use]
pub fn detect_mime_type(data: &[u8]) -> Option<&'static str> {
    // PNG: 89 50 4E 47 0D 0A 1A 0A
    if data
        .get(0..8)
        .is_some_and(|slice| slice == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])
    {
        return Some("image/png");
    }

    // JPEG: FF D8 FF
    if data.get(0..3).is_some_and(|slice| slice == [0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }

    // WebP: RIFF....WEBP
    if data.get(0..4).is_some_and(|slice| slice == b"RIFF")
        && data.get(8..12).is_some_and(|slice| slice == b"WEBP")
    {
        return Some("image/webp");
    }

    None
}

/// Lowercase, drop parameters, fold the `image/jpg` alias
fn normalize_mime(declared: &str) -> String {
    let essence = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        essence
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

/// Unique-name file store backing the upload endpoint
#[derive(Debug, Clone)]
pub struct UploadService {
    root: PathBuf,
    policy: UploadPolicy,
}

impl UploadService {
    /// Store uploads under `root`, creating it if needed
    pub fn new<P: Into<PathBuf>>(root: P, policy: UploadPolicy) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| CutoutError::file_io_error("create upload directory", &root, &e))?;
        Ok(Self { root, policy })
    }

    /// Store uploads in a directory under the system temp dir
    pub fn in_temp_dir(policy: UploadPolicy) -> Result<Self> {
        Self::new(std::env::temp_dir().join("imgly-cutout-uploads"), policy)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Check an upload without storing it, returning its normalized MIME type
    ///
    /// # Errors
    /// `InvalidInput` naming the specific reason: empty, too large, type not
    /// allowed, or content not matching the declared type.
    pub fn validate(&self, declared_mime: &str, bytes: &[u8]) -> Result<String> {
        if bytes.is_empty() {
            return Err(CutoutError::invalid_input("Uploaded file is empty"));
        }

        let size = bytes.len() as u64;
        if size > self.policy.max_bytes {
            return Err(CutoutError::invalid_input(format!(
                "File too large: {} bytes (maximum {} bytes)",
                size, self.policy.max_bytes
            )));
        }

        let mime_type = normalize_mime(declared_mime);
        if !self.policy.allows(&mime_type) {
            return Err(CutoutError::invalid_input(format!(
                "Unsupported file type '{}': allowed types are {}",
                declared_mime,
                self.policy.allowed_mime_types.join(", ")
            )));
        }

        match detect_mime_type(bytes) {
            Some(detected) if detected == mime_type => Ok(mime_type),
            Some(detected) => Err(CutoutError::invalid_input(format!(
                "File content is {} but was declared as {}",
                detected, mime_type
            ))),
            None => Err(CutoutError::invalid_input(format!(
                "File content is not a recognizable {} image",
                mime_type
            ))),
        }
    }

    /// Validate and store an upload
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn store(&self, declared_mime: &str, bytes: &[u8]) -> Result<StoredUpload> {
        let mime_type = self.validate(declared_mime, bytes)?;

        let id = Uuid::new_v4();
        let extension = extension_for(&mime_type);
        let original = format!("{}.{}", id, extension);
        let processed = format!("{}-processed.{}", id, extension);
        let original_path = self.root.join(&original);
        let processed_path = self.root.join(&processed);

        tokio::fs::write(&original_path, bytes)
            .await
            .map_err(|e| CutoutError::file_io_error("store upload", &original_path, &e))?;

        if let Err(e) = tokio::fs::copy(&original_path, &processed_path).await {
            // All-or-nothing: no orphaned original
            let _ = tokio::fs::remove_file(&original_path).await;
            return Err(CutoutError::file_io_error("store processed copy", &processed_path, &e));
        }

        info!(%id, mime_type = %mime_type, "Stored upload");
        Ok(StoredUpload {
            id,
            original,
            processed,
            mime_type,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            original_path,
            processed_path,
        })
    }

    /// Replace the processed resource of an upload with real output
    pub async fn replace_processed(&self, upload: &StoredUpload, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(&upload.processed_path, bytes)
            .await
            .map_err(|e| CutoutError::file_io_error("write processed upload", &upload.processed_path, &e))
    }

    /// Delete stored files older than `max_age`
    pub async fn cleanup(&self, max_age: Duration) -> Result<CleanupReport> {
        cleanup_expired(&self.root, max_age).await
    }

    /// Run `cleanup` every `policy.interval` until the returned task is dropped
    ///
    /// # Errors
    /// - `InvalidConfig` when the policy is rejected by `CleanupPolicy::validate`
    pub fn spawn_cleanup(self: &Arc<Self>, policy: CleanupPolicy) -> Result<CleanupTask> {
        policy.validate()?;
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.cleanup(policy.max_age).await {
                    Ok(report) if report.removed > 0 => {
                        info!(removed = report.removed, retained = report.retained, "Cleaned up uploads");
                    },
                    Ok(_) => {},
                    Err(e) => warn!(error = %e, "Upload cleanup failed"),
                }
            }
        });
        Ok(CleanupTask { handle })
    }
}

/// Handle to the scheduled cleanup; dropping it stops the schedule
#[derive(Debug)]
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl CleanupTask {
    pub fn stop(self) {
        drop(self);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Delete regular files in `dir` whose modification time is older than `max_age`
#[instrument(skip(dir), fields(dir = %dir.display()))]
pub async fn cleanup_expired(dir: &Path, max_age: Duration) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(CutoutError::file_io_error("read upload directory", dir, &e)),
    };

    let now = SystemTime::now();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CutoutError::file_io_error("read upload directory", dir, &e))?
    {
        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();

        if age > max_age {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Removed expired upload");
                    report.removed += 1;
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove expired upload");
                    report.retained += 1;
                },
            }
        } else {
            report.retained += 1;
        }
    }

    Ok(report)
}
