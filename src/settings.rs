//! Global settings record and its store
//!
//! The service keeps exactly one settings record. Reads return a snapshot;
//! updates merge a partial patch into the current record, validate the merged
//! result and only then replace the stored record (last write wins). A
//! rejected update leaves the stored record untouched.

use crate::config::{parse_hex_color, DilationStrategy};
use crate::error::{CutoutError, Result};
use crate::models::ModelChoice;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

/// Largest accepted dilation or feather radius, in pixels
pub const MAX_EDGE_RADIUS: u32 = 64;

/// Backdrop type as stored in the settings record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackdropType {
    #[default]
    Transparent,
    Color,
    Image,
}

/// The single global settings record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub model: ModelChoice,
    /// 0-100
    pub foreground_threshold: u8,
    /// 0-100, at most `foreground_threshold`
    pub background_threshold: u8,
    pub alpha_matting: bool,
    pub background_type: BackdropType,
    /// `#rrggbb`
    pub background_color: String,
    pub background_image: Option<String>,
    pub allow_resize: bool,
    pub allow_move: bool,
    pub edge_dilation: u32,
    pub dilation_strategy: DilationStrategy,
    pub edge_feather: u32,
    /// 0-100
    pub feather_opacity: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: ModelChoice::default(),
            foreground_threshold: 50,
            background_threshold: 10,
            alpha_matting: false,
            background_type: BackdropType::Transparent,
            background_color: "#ffffff".to_string(),
            background_image: None,
            allow_resize: true,
            allow_move: true,
            edge_dilation: 0,
            dilation_strategy: DilationStrategy::default(),
            edge_feather: 0,
            feather_opacity: 50,
        }
    }
}

impl Settings {
    /// Check every invariant of the record
    pub fn validate(&self) -> Result<()> {
        if self.foreground_threshold > 100 {
            return Err(CutoutError::settings_value_error(
                "foregroundThreshold",
                self.foreground_threshold,
                "0-100",
            ));
        }
        if self.background_threshold > 100 {
            return Err(CutoutError::settings_value_error(
                "backgroundThreshold",
                self.background_threshold,
                "0-100",
            ));
        }
        if self.background_threshold > self.foreground_threshold {
            return Err(CutoutError::invalid_settings(format!(
                "backgroundThreshold ({}) must not exceed foregroundThreshold ({})",
                self.background_threshold, self.foreground_threshold
            )));
        }
        if self.feather_opacity > 100 {
            return Err(CutoutError::settings_value_error(
                "featherOpacity",
                self.feather_opacity,
                "0-100",
            ));
        }
        if self.edge_dilation > MAX_EDGE_RADIUS {
            return Err(CutoutError::settings_value_error(
                "edgeDilation",
                self.edge_dilation,
                "0-64",
            ));
        }
        if self.edge_feather > MAX_EDGE_RADIUS {
            return Err(CutoutError::settings_value_error(
                "edgeFeather",
                self.edge_feather,
                "0-64",
            ));
        }

        parse_hex_color(&self.background_color).map_err(|_| {
            CutoutError::invalid_settings(format!(
                "backgroundColor '{}' is not a #rrggbb color",
                self.background_color
            ))
        })?;

        if self.background_type == BackdropType::Image && self.background_image.is_none() {
            return Err(CutoutError::invalid_settings(
                "backgroundType is 'image' but no backgroundImage is set",
            ));
        }

        Ok(())
    }

    /// Apply a partial update, producing a new (unvalidated) record
    #[must_use]
    pub fn merged(&self, patch: SettingsPatch) -> Self {
        let mut next = self.clone();
        if let Some(model) = patch.model {
            next.model = model;
        }
        if let Some(value) = patch.foreground_threshold {
            next.foreground_threshold = value;
        }
        if let Some(value) = patch.background_threshold {
            next.background_threshold = value;
        }
        if let Some(value) = patch.alpha_matting {
            next.alpha_matting = value;
        }
        if let Some(value) = patch.background_type {
            next.background_type = value;
        }
        if let Some(value) = patch.background_color {
            next.background_color = value;
        }
        if let Some(value) = patch.background_image {
            // An empty reference clears the image
            next.background_image = if value.is_empty() { None } else { Some(value) };
        }
        if let Some(value) = patch.allow_resize {
            next.allow_resize = value;
        }
        if let Some(value) = patch.allow_move {
            next.allow_move = value;
        }
        if let Some(value) = patch.edge_dilation {
            next.edge_dilation = value;
        }
        if let Some(value) = patch.dilation_strategy {
            next.dilation_strategy = value;
        }
        if let Some(value) = patch.edge_feather {
            next.edge_feather = value;
        }
        if let Some(value) = patch.feather_opacity {
            next.feather_opacity = value;
        }
        next
    }
}

/// Partial settings update, as posted by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground_threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha_matting: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_type: Option<BackdropType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_resize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_move: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_dilation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dilation_strategy: Option<DilationStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_feather: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feather_opacity: Option<u8>,
}

impl SettingsPatch {
    /// Parse a JSON request body; schema violations become `InvalidSettings`
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| CutoutError::invalid_settings(format!("Malformed settings update: {}", e)))
    }
}

/// Store holding the single settings record, optionally backed by a JSON file
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Settings>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// In-memory store starting from defaults
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Settings::default()),
            path: None,
        }
    }

    /// In-memory store starting from `settings`
    pub fn with_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            current: RwLock::new(settings),
            path: None,
        })
    }

    /// File-backed store; a missing file starts from defaults
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let settings = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| CutoutError::file_io_error("read settings file", &path, &e))?;
            let settings: Settings = serde_json::from_str(&contents)?;
            settings.validate()?;
            debug!("Loaded settings from disk");
            settings
        } else {
            info!("No settings file found, starting from defaults");
            Settings::default()
        };

        Ok(Self {
            current: RwLock::new(settings),
            path: Some(path),
        })
    }

    /// Snapshot of the current record
    #[must_use]
    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge, validate and persist a partial update
    ///
    /// # Errors
    /// - `InvalidSettings` when the merged record violates an invariant;
    ///   the stored record is unchanged
    /// - I/O errors from persisting a file-backed store; the in-memory
    ///   record is unchanged
    #[instrument(skip_all)]
    pub fn update(&self, patch: SettingsPatch) -> Result<Settings> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let candidate = current.merged(patch);
        if let Err(e) = candidate.validate() {
            warn!(error = %e, "Rejected settings update");
            return Err(e);
        }

        if let Some(path) = &self.path {
            Self::persist(path, &candidate)?;
        }

        *current = candidate.clone();
        info!("Settings updated");
        Ok(candidate)
    }

    /// Parse and apply a JSON update body
    pub fn update_json(&self, body: &str) -> Result<Settings> {
        self.update(SettingsPatch::from_json(body)?)
    }

    /// Backing file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write atomically: temp file in the same directory, then rename
    fn persist(path: &Path, settings: &Settings) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| CutoutError::file_io_error("create settings directory", parent, &e))?;

        let json = serde_json::to_vec_pretty(settings)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| CutoutError::file_io_error("create temporary settings file", parent, &e))?;
        temp.write_all(&json)
            .map_err(|e| CutoutError::file_io_error("write settings", temp.path(), &e))?;
        temp.persist(path)
            .map_err(|e| CutoutError::file_io_error("replace settings file", path, &e.error))?;

        debug!(bytes = json.len(), "Persisted settings");
        Ok(())
    }
}
