//! Configuration management for yank
//!
//! User-editable settings live at `~/.yank/config.json` and can be
//! inspected or changed through `yank config`. Missing keys fall back to
//! their defaults, so older config files keep working across upgrades.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default TCP service port.
pub const DEFAULT_PORT: u16 = 9876;

const MIB: u64 = 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown key passed to `config --set`
    #[error("unknown config key: {0}")]
    UnknownKey(String),

    /// Value failed to parse for its key
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// User configuration, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port the agent listens on and connects to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether file clipboard contents are synced
    #[serde(default = "default_true")]
    pub sync_files: bool,

    /// Whether text clipboard contents are synced
    #[serde(default = "default_true")]
    pub sync_text: bool,

    /// Whether image clipboard contents are synced
    #[serde(default = "default_true")]
    pub sync_images: bool,

    /// Maximum size of a single file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum total size of one transfer in bytes
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,

    /// Extensions dropped from outbound transfers, in addition to ~/.syncignore
    #[serde(default = "default_ignored_extensions")]
    pub ignored_extensions: Vec<String>,

    /// File sets at or above this total size are announced instead of
    /// shipped inline
    #[serde(default = "default_lazy_threshold")]
    pub lazy_threshold: u64,

    /// Chunk size for streamed file transfers
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Seconds an announced transfer stays requestable
    #[serde(default = "default_transfer_expiry")]
    pub transfer_expiry: u64,

    /// Clipboard polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    100 * MIB
}

fn default_max_total_size() -> u64 {
    500 * MIB
}

fn default_ignored_extensions() -> Vec<String> {
    [".tmp", ".temp", ".bak", ".swp", ".lock"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_lazy_threshold() -> u64 {
    10 * MIB
}

fn default_chunk_size() -> u64 {
    MIB
}

fn default_transfer_expiry() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            sync_files: true,
            sync_text: true,
            sync_images: true,
            max_file_size: default_max_file_size(),
            max_total_size: default_max_total_size(),
            ignored_extensions: default_ignored_extensions(),
            lazy_threshold: default_lazy_threshold(),
            chunk_size: default_chunk_size(),
            transfer_expiry: default_transfer_expiry(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    /// Per-user data directory (`~/.yank`).
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".yank")
    }

    /// Default config file location (`~/.yank/config.json`).
    pub fn default_path() -> PathBuf {
        Self::data_dir().join("config.json")
    }

    /// Load from `path`, creating the file with defaults when absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut raw = serde_json::to_vec_pretty(self)?;
        raw.push(b'\n');
        atomic_write(path, &raw)?;
        Ok(())
    }

    /// Apply `config --set KEY VALUE`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "port" => self.port = parse_num(key, value)?,
            "sync_files" => self.sync_files = parse_bool(key, value)?,
            "sync_text" => self.sync_text = parse_bool(key, value)?,
            "sync_images" => self.sync_images = parse_bool(key, value)?,
            "max_file_size" => self.max_file_size = parse_num(key, value)?,
            "max_total_size" => self.max_total_size = parse_num(key, value)?,
            "lazy_threshold" => self.lazy_threshold = parse_num(key, value)?,
            "chunk_size" => self.chunk_size = parse_num(key, value)?,
            "transfer_expiry" => self.transfer_expiry = parse_num(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = parse_num(key, value)?,
            "ignored_extensions" => {
                self.ignored_extensions = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transfer_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.transfer_expiry)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected true/false, got {value:?}"),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("expected a number, got {value:?}"),
    })
}

/// Write `content` to `path` via a sibling temp file and rename, so a
/// mid-write crash never leaves a truncated file behind.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 9876);
        assert_eq!(config.lazy_threshold, 10 * MIB);
        assert_eq!(config.chunk_size, MIB);
        assert_eq!(config.transfer_expiry, 300);
        assert_eq!(config.poll_interval_ms, 300);
        assert!(config.sync_files && config.sync_text && config.sync_images);
    }

    #[test]
    fn load_creates_defaults_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = Config::load(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(created.port, reloaded.port);
        assert_eq!(created.ignored_extensions, reloaded.ignored_extensions);
    }

    #[test]
    fn partial_file_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 4321, "sync_text": false}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 4321);
        assert!(!config.sync_text);
        assert_eq!(config.chunk_size, MIB);
    }

    #[test]
    fn set_parses_and_rejects() {
        let mut config = Config::default();
        config.set("lazy_threshold", "1048576").unwrap();
        assert_eq!(config.lazy_threshold, MIB);

        config.set("sync_images", "off").unwrap();
        assert!(!config.sync_images);

        config
            .set("ignored_extensions", ".iso, .dmg")
            .unwrap();
        assert_eq!(config.ignored_extensions, vec![".iso", ".dmg"]);

        assert!(matches!(
            config.set("bogus", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            config.set("port", "not-a-number"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
