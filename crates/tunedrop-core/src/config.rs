//! Engine configuration management.
//!
//! Handles loading, saving, and validating the engine-wide settings: where
//! finished and in-progress files live, how many transfers may run at once,
//! network limits, and the default post-processing target.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::convert::ConversionConfig;
use crate::error::{Error, FileSystemError, Result};
use crate::fetch::FetchConfig;
use crate::scheduler::SchedulerConfig;

/// Name of the directory holding partial downloads, relative to the
/// download directory when no explicit location is configured.
pub const INCOMPLETE_DIR_NAME: &str = ".incomplete";

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory where finished files are placed.
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    /// Directory for partial files. Defaults to `<download_directory>/.incomplete`.
    #[serde(default)]
    pub incomplete_directory: Option<PathBuf>,
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// HTTP configuration.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Post-processing configuration.
    #[serde(default)]
    pub conversion: ConversionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            incomplete_directory: None,
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            conversion: ConversionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default location, or create defaults if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {}, using defaults", path.display());
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.validate();

        info!("Loaded config from {}", path.display());
        debug!(
            "Download directory: {}",
            config.download_directory.display()
        );

        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Clamp every section to its supported range.
    pub fn validate(&mut self) {
        self.scheduler.validate();
        self.fetch.validate();
    }

    /// Directory where partial files are kept.
    #[must_use]
    pub fn incomplete_directory(&self) -> PathBuf {
        self.incomplete_directory
            .clone()
            .unwrap_or_else(|| self.download_directory.join(INCOMPLETE_DIR_NAME))
    }

    /// Get the path to the default config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Get the default download directory.
#[must_use]
pub fn default_download_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunedrop")
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("tunedrop")
        .join("config.json")
}
