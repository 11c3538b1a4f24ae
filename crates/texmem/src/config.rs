//! Tunables for eviction, pinning and placement.
//!
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically. Values missing from a file keep their defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration for a texture-memory manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TexMemConfig {
    /// Evictions allowed back to back before a request gives up
    pub max_consecutive_evictions: u32,
    /// Frames without eviction after which the consecutive count resets
    pub eviction_reset_frames: u32,
    /// Frames a freshly placed texture is protected from eviction (0 disables)
    pub pin_window_frames: u32,
    /// Textures smaller than this are replicated on dual-unit hardware
    pub replicate_threshold: u32,
    /// Replication threshold for luminance and intensity textures
    pub replicate_threshold_luminance: u32,
    /// Reject placement changes through `Split` instead of evicting and retrying
    pub strict_transitions: bool,
    /// Upper bound on free-list range nodes; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_range_nodes: Option<usize>,
}

impl Default for TexMemConfig {
    fn default() -> Self {
        Self {
            max_consecutive_evictions: 3,
            eviction_reset_frames: 10,
            pin_window_frames: 0,
            replicate_threshold: 32 * 1024,
            replicate_threshold_luminance: 8 * 1024,
            strict_transitions: false,
            max_range_nodes: None,
        }
    }
}

impl TexMemConfig {
    /// Sets the consecutive eviction ceiling.
    pub fn with_max_consecutive_evictions(mut self, max: u32) -> Self {
        self.max_consecutive_evictions = max;
        self
    }

    pub fn with_eviction_reset_frames(mut self, frames: u32) -> Self {
        self.eviction_reset_frames = frames;
        self
    }

    /// Sets the pin window in frames.
    pub fn with_pin_window(mut self, frames: u32) -> Self {
        self.pin_window_frames = frames;
        self
    }

    /// Sets the general and luminance replication thresholds in bytes.
    pub fn with_replicate_thresholds(mut self, general: u32, luminance: u32) -> Self {
        self.replicate_threshold = general;
        self.replicate_threshold_luminance = luminance;
        self
    }

    pub fn with_strict_transitions(mut self, strict: bool) -> Self {
        self.strict_transitions = strict;
        self
    }

    pub fn with_max_range_nodes(mut self, max: usize) -> Self {
        self.max_range_nodes = Some(max);
        self
    }

    /// Returns the default configuration file for the current platform.
    ///
    /// - macOS: ~/Library/Application Support/texmem/texmem.toml
    /// - Linux: ~/.config/texmem/texmem.toml
    /// - Windows: %APPDATA%\texmem\texmem.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("texmem").join("texmem.toml")
        } else {
            PathBuf::from("texmem.toml")
        }
    }

    /// Loads the default file when present, then applies environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file or any environment variable is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_config_path();
        let base = if path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        base.apply_env()
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TEXMEM_MAX_CONSECUTIVE_EVICTIONS` (default: 3)
    /// - `TEXMEM_EVICTION_RESET_FRAMES` (default: 10)
    /// - `TEXMEM_PIN_WINDOW_FRAMES` (default: 0)
    /// - `TEXMEM_REPLICATE_THRESHOLD` in bytes (default: 32768)
    /// - `TEXMEM_REPLICATE_THRESHOLD_LUMINANCE` in bytes (default: 8192)
    /// - `TEXMEM_STRICT_TRANSITIONS`: `true`/`false`/`1`/`0` (default: false)
    /// - `TEXMEM_MAX_RANGE_NODES` (default: unbounded)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overrides fields with any `TEXMEM_*` environment variables that are set.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(value) = env_parse("TEXMEM_MAX_CONSECUTIVE_EVICTIONS")? {
            self.max_consecutive_evictions = value;
        }
        if let Some(value) = env_parse("TEXMEM_EVICTION_RESET_FRAMES")? {
            self.eviction_reset_frames = value;
        }
        if let Some(value) = env_parse("TEXMEM_PIN_WINDOW_FRAMES")? {
            self.pin_window_frames = value;
        }
        if let Some(value) = env_parse("TEXMEM_REPLICATE_THRESHOLD")? {
            self.replicate_threshold = value;
        }
        if let Some(value) = env_parse("TEXMEM_REPLICATE_THRESHOLD_LUMINANCE")? {
            self.replicate_threshold_luminance = value;
        }
        if let Ok(value) = std::env::var("TEXMEM_STRICT_TRANSITIONS") {
            self.strict_transitions = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "TEXMEM_STRICT_TRANSITIONS".to_string(),
                    ))
                }
            };
        }
        if let Some(value) = env_parse("TEXMEM_MAX_RANGE_NODES")? {
            self.max_range_nodes = Some(value);
        }

        self.validate()?;
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// max_consecutive_evictions = 3
    /// eviction_reset_frames = 10
    /// pin_window_frames = 2
    /// replicate_threshold = 32768
    /// replicate_threshold_luminance = 8192
    /// strict_transitions = false
    /// max_range_nodes = 4096
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(format!("# texmem configuration\n{}", toml::to_string(self)?))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_range_nodes == Some(0) {
            return Err(ConfigError::InvalidValue("max_range_nodes".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
