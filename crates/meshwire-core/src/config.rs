//! Configuration system for meshwire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshwire/config.toml
//!   3. ~/.config/meshwire/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW, MAX_CHUNK_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeshwireConfig {
    pub channels: ChannelsConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Directory holding the persisted channel keys.
    pub store_dir: PathBuf,
    /// Key rotation period for newly joined channels. 0 = static keys.
    pub epoch_length_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per chunk, 1..=255.
    pub chunk_size: usize,
    /// Chunks handed out per `next_chunks` call.
    pub window: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            store_dir: data_dir().join("store"),
            epoch_length_secs: 0,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: DEFAULT_WINDOW,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshwire")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("meshwire")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshwireConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise start from defaults. No env
    /// overrides or validation are applied.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshwireConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the transfer engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "transfer.chunk_size must be 1..={MAX_CHUNK_PAYLOAD}, got {}",
                self.transfer.chunk_size
            )));
        }
        if self.transfer.window == 0 {
            return Err(ConfigError::Invalid(
                "transfer.window must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply MESHWIRE_* overrides. `lookup` resolves a variable name;
    /// unparseable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MESHWIRE_CHANNELS__STORE_DIR") {
            self.channels.store_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MESHWIRE_CHANNELS__EPOCH_LENGTH_SECS") {
            if let Ok(n) = v.parse() {
                self.channels.epoch_length_secs = n;
            }
        }
        if let Some(v) = lookup("MESHWIRE_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Some(v) = lookup("MESHWIRE_TRANSFER__WINDOW") {
            if let Ok(n) = v.parse() {
                self.transfer.window = n;
            }
        }
    }
}
