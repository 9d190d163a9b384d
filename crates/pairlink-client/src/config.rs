//! Client configuration

use pairlink_core::TransferSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name announced to peers; the server-assigned name when unset
    pub display_name: Option<String>,

    /// Data directory path
    pub data_dir: String,

    /// Whether this endpoint can open direct connections
    pub rtc_supported: bool,

    /// Where received files are written; in-memory assembly when unset
    pub download_dir: Option<String>,

    /// Transfer engine tunables
    pub transfer: TransferSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            data_dir: "~/.pairlink".to_string(),
            rtc_supported: true,
            download_dir: Some("~/.pairlink/downloads".to_string()),
            transfer: TransferSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn download_dir(&self) -> Option<PathBuf> {
        self.download_dir.as_deref().map(expand_path)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
