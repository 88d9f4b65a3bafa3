// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::device::priority::ServicePriority;
use crate::constants::*;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// User configuration, persisted as JSON in the user config directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consecutive invalid mapping frames during which the last good value is held
    pub mapping_hold_frames: u32,
    /// Pause after a rejected stream reconfiguration (milliseconds)
    pub reconfigure_backoff_ms: u64,
    /// Pause after a failed capture iteration (milliseconds)
    pub error_backoff_ms: u64,
    /// Pause while no stream is enabled (milliseconds)
    pub idle_sleep_ms: u64,
    /// Pause between polls while streams are not yet aligned (milliseconds)
    pub poll_interval_ms: u64,
    /// Helper service priority requested by the command line front-end
    pub service_priority: ServicePriority,
    /// Where `snapshot` writes images when no output is given
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mapping_hold_frames: DEFAULT_MAPPING_HOLD_FRAMES,
            reconfigure_backoff_ms: DEFAULT_RECONFIGURE_BACKOFF.as_millis() as u64,
            error_backoff_ms: DEFAULT_ERROR_BACKOFF.as_millis() as u64,
            idle_sleep_ms: DEFAULT_IDLE_SLEEP.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            service_priority: ServicePriority::default(),
            snapshot_dir: None,
        }
    }
}

impl Config {
    /// Default location of the config file
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the config from the default location.
    ///
    /// A missing or unreadable file yields the defaults.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Load the config from a specific file
    pub fn load_from(path: &std::path::Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save the config to the default location
    pub fn save(&self) -> AppResult<PathBuf> {
        let path = Self::path()
            .ok_or_else(|| AppError::Config("No config directory available".to_string()))?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save the config to a specific file, creating parent directories
    pub fn save_to(&self, path: &std::path::Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Directory used by `snapshot` when no output is given
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir.clone().unwrap_or_else(|| {
            dirs::picture_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
        })
    }
}

/// Timing and mapping settings handed to every capture worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    /// Dirty counter ceiling for software depth-to-color mapping
    pub mapping_hold_frames: u32,
    pub reconfigure_backoff: Duration,
    pub error_backoff: Duration,
    pub idle_sleep: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CaptureSettings {
    fn from(config: &Config) -> Self {
        Self {
            mapping_hold_frames: config.mapping_hold_frames,
            reconfigure_backoff: Duration::from_millis(config.reconfigure_backoff_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}
