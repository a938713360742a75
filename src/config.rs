//! Bridge configuration
//!
//! Every section carries `#[serde(default)]` so a partial `config.toml`
//! only overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub retry: RetryConfig,
    pub playback: PlaybackConfig,
    pub health: HealthConfig,
    pub capture: CaptureConfig,
}

/// Connect retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Connect attempts before a request is given up
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff_ms: u64,
    /// Upper bound for a single connect attempt
    pub connect_timeout_ms: u64,
    /// Pause after leaving a channel before joining another
    pub switch_settle_ms: u64,
    /// Re-run the whole connect cycle after the session drops
    pub auto_restart: bool,
    /// Delay before a full-cycle restart
    pub restart_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 5_000,
            connect_timeout_ms: 10_000,
            switch_settle_ms: 1_000,
            auto_restart: true,
            restart_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn switch_settle(&self) -> Duration {
        Duration::from_millis(self.switch_settle_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Playback start policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Attempts to start playback when the transport is already playing
    pub start_attempts: u32,
    /// Wait between stop and the next start attempt
    pub retry_delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

impl PlaybackConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Health monitoring cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_ms: u64,
    pub status_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            status_interval_ms: 60_000,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Longest a single frame read may wait for the device
    pub read_timeout_ms: u64,
    /// RMS (16-bit scale) above which a frame counts as activity
    pub noise_floor: f32,
    /// Minimum frames between two activity log lines
    pub report_interval_frames: u64,
    pub activity_logging: bool,
    /// Capture callback chunks buffered ahead of the reader
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: crate::constants::FRAME_DURATION_MS,
            noise_floor: 100.0,
            report_interval_frames: crate::constants::FRAMES_PER_SECOND as u64,
            activity_logging: true,
            queue_capacity: 64,
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Platform config location, e.g. `~/.config/voice-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voice-bridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` (or the default location), falling back to defaults
    /// when no file exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let config = Self::load(&path)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
