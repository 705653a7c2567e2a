//! Configuration storage for workcell calibration settings.
//!
//! All config is stored in ~/.cf_config/ by default.

use crate::calibration_config::CalibrationConfig;
use std::path::{Path, PathBuf};

/// Configuration storage manager.
///
/// Manages loading and saving of calibration configuration files
/// from a centralized directory (defaults to ~/.cf_config/).
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.cf_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.cf_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".cf_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Get the calibration config file path
    pub fn calibration_config_path(&self) -> PathBuf {
        self.root_path.join("calibration.json")
    }

    /// Get the stored calibration config.
    ///
    /// Returns None if no config file exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn get_calibration_config(&self) -> Option<Result<CalibrationConfig, std::io::Error>> {
        let path = self.calibration_config_path();

        if !path.exists() {
            return None;
        }

        Some(CalibrationConfig::load_from_file(&path))
    }

    /// Stored config, or defaults when none has been saved.
    pub fn calibration_config_or_default(&self) -> std::io::Result<CalibrationConfig> {
        self.get_calibration_config()
            .unwrap_or_else(|| Ok(CalibrationConfig::default()))
    }

    /// Save the calibration config.
    ///
    /// Creates the root directory if it doesn't exist.
    /// Returns the path where the config was saved.
    pub fn save_calibration_config(&self, config: &CalibrationConfig) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;

        let path = self.calibration_config_path();
        config.save_to_file(&path)?;
        Ok(path)
    }

    /// Delete the stored calibration config.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_calibration_config(&self) -> std::io::Result<bool> {
        let path = self.calibration_config_path();

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }
}
