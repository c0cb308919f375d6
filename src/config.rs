//! Configuration Module
//!
//! Loads toolkit configuration from a TOML file at
//! `~/.config/egret/config.toml`, auto-generating a default file on first
//! run if missing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::window::BackendHint;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub framebuffer: FramebufferConfig,
    pub kms: KmsConfig,
    pub window: WindowConfig,
}

/// Software framebuffer backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramebufferConfig {
    /// Framebuffer device path
    pub device: PathBuf,
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self { device: PathBuf::from("/dev/fb0") }
    }
}

/// KMS overlay backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// DRM card device path
    pub card: PathBuf,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self { card: PathBuf::from("/dev/dri/card0") }
    }
}

/// Window backend defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Backend negotiation hint applied when a window does not specify one
    pub backend_hint: BackendHint,
    /// Buffer count for hardware overlay screens
    pub buffer_count: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { backend_hint: BackendHint::Automatic, buffer_count: 3 }
    }
}

impl Config {
    /// Load configuration from the default path, or use defaults if the
    /// file does not exist (writing the default file for next time)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {:?}: {}", path, e)))?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("no config directory for this user".into()))?
            .join("egret");

        Ok(config_dir.join("config.toml"))
    }

    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("failed to create {:?}: {}", parent, e)))?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| Error::Config(format!("failed to serialize defaults: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| Error::Config(format!("failed to write {:?}: {}", path, e)))?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.framebuffer.device, PathBuf::from("/dev/fb0"));
        assert_eq!(config.kms.card, PathBuf::from("/dev/dri/card0"));
        assert_eq!(config.window.buffer_count, 3);
        assert_eq!(config.window.backend_hint, BackendHint::Automatic);
    }

    #[test]
    fn test_parse_partial_file() {
        let parsed: Config = toml::from_str(
            r#"
            [framebuffer]
            device = "/dev/fb1"

            [window]
            backend_hint = "overlay"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.framebuffer.device, PathBuf::from("/dev/fb1"));
        assert_eq!(parsed.window.backend_hint, BackendHint::Overlay);
        // Unspecified sections fall back to defaults.
        assert_eq!(parsed.window.buffer_count, 3);
        assert_eq!(parsed.kms.card, PathBuf::from("/dev/dri/card0"));
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.window.buffer_count, config.window.buffer_count);
    }
}
