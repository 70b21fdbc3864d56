use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::link::LinkConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataNodeConfig {
    /// Address to listen on; also the address announced to the volmgr.
    pub host: String,
    pub data_dir: PathBuf,
    pub tier: String,
    pub volmgr_hosts: Vec<String>,
    pub log_level: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for a replica or volmgr reply.
    pub io_timeout_ms: u64,
    pub max_frame_bytes: u32,
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:9100".to_string(),
            data_dir: PathBuf::from("/var/lib/chunkfs/data"),
            tier: "sata".to_string(),
            volmgr_hosts: Vec::new(),
            log_level: "info".to_string(),
            connect_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl DataNodeConfig {
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

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            nodelay: true,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = DataNodeConfig::default();
        assert_eq!(config.host, "127.0.0.1:9100");
        assert_eq!(config.tier, "sata");
        assert!(config.volmgr_hosts.is_empty());
        assert_eq!(config.io_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
host = "0.0.0.0:9200"
data_dir = "/data/dn1"
volmgr_hosts = ["10.0.0.1:7000", "10.0.0.2:7000"]
io_timeout_ms = 250
"#
        )
        .unwrap();

        let config = DataNodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0:9200");
        assert_eq!(config.data_dir, PathBuf::from("/data/dn1"));
        assert_eq!(config.volmgr_hosts.len(), 2);
        assert_eq!(config.io_timeout(), Duration::from_millis(250));
        assert_eq!(config.tier, "sata");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"tier": "ssd", "max_frame_bytes": 1024}}"#).unwrap();

        let config = DataNodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tier, "ssd");
        assert_eq!(config.link_config().max_frame_bytes, 1024);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(DataNodeConfig::from_file(file.path()).is_err());
    }
}
