//! Client configuration loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::filesystem::ChunkFsConfig;

/// Settings for one mount. Missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory to mount on.
    pub mountpoint: PathBuf,
    /// Attribute cache timeout in milliseconds.
    pub attr_ttl_ms: u64,
    /// Entry cache timeout in milliseconds.
    pub entry_ttl_ms: u64,
    /// Comma-separated FUSE mount options.
    pub mount_options: String,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/mnt/chunkfs"),
            attr_ttl_ms: 1_000,
            entry_ttl_ms: 1_000,
            mount_options: String::new(),
            log_level: String::from("info"),
        }
    }
}

impl ClientConfig {
    /// Loads a config file, picking the format from its extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Filesystem settings for a mount owned by `uid`/`gid`.
    pub fn fs_config(&self, uid: u32, gid: u32) -> ChunkFsConfig {
        ChunkFsConfig {
            uid,
            gid,
            attr_timeout: Duration::from_millis(self.attr_ttl_ms),
            entry_timeout: Duration::from_millis(self.entry_ttl_ms),
        }
    }
}
