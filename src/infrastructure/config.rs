use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{AppResult, ResultExt};
use crate::infrastructure::protocol::{DEFAULT_DISCOVERY_PORT, DEFAULT_TCP_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShareConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
    pub read_only: bool,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            share_id: None,
            name: None,
            path: String::new(),
            read_only: true,
        }
    }
}

/// Everything the settings collaborator supplies to the core. Loaded from a
/// JSON file; unknown fields are ignored so minor-version configs keep
/// working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub device_id: String,
    pub device_name: String,
    pub discovery_port: u16,
    pub tcp_port: u16,
    pub bind_addr: String,
    pub open_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_key: Option<String>,
    pub download_dir: String,
    pub respond_to_queries: bool,
    pub announce_interval_ms: u64,
    pub shares: Vec<ShareConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_name: String::new(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            bind_addr: "0.0.0.0".to_string(),
            open_mode: true,
            shared_key: None,
            download_dir: String::new(),
            respond_to_queries: true,
            announce_interval_ms: 2000,
            shares: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, tolerating a missing file. Generated identity and
    /// clamped values are written back so the next load sees them.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut config = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<Self>(&bytes)
                .with_code("BAD_REQUEST", "config file is not valid JSON")
                .with_ctx("path", path.display().to_string())?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(error) => {
                return Err(error)
                    .with_code("IO_ERROR", "config read failed")
                    .with_ctx("path", path.display().to_string());
            }
        };

        let before = serde_json::to_string(&config).unwrap_or_default();
        config.normalize();
        let after = serde_json::to_string(&config).unwrap_or_default();
        if before != after {
            config.save(path)?;
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_code("IO_ERROR", "config directory create failed")
                .with_ctx("path", parent.display().to_string())?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .with_code("INTERNAL_ERROR", "config encode failed")?;
        std::fs::write(path, bytes)
            .with_code("IO_ERROR", "config write failed")
            .with_ctx("path", path.display().to_string())
    }

    fn normalize(&mut self) {
        if self.device_id.trim().is_empty() {
            self.device_id = uuid::Uuid::new_v4().to_string();
        }
        if self.device_name.trim().is_empty() {
            self.device_name = resolve_device_name();
        }
        if self.bind_addr.trim().is_empty() {
            self.bind_addr = "0.0.0.0".to_string();
        }
        if self.download_dir.trim().is_empty() {
            self.download_dir = resolve_default_download_dir();
        }
        self.announce_interval_ms = self.announce_interval_ms.clamp(500, 60_000);
        if let Some(key) = &self.shared_key
            && key.trim().is_empty()
        {
            self.shared_key = None;
        }
    }
}

fn resolve_device_name() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(var) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    "netshare-device".to_string()
}

fn resolve_default_download_dir() -> String {
    if let Some(home) = dirs_home() {
        return home.join("Downloads").to_string_lossy().to_string();
    }
    "downloads".to_string()
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir().join(format!("netshare-config-{}.json", Uuid::new_v4()))
    }

    #[test]
    fn missing_file_should_yield_defaults_with_identity() {
        let path = temp_config_path();
        let config = NodeConfig::load(&path).expect("load");
        assert!(!config.device_id.is_empty());
        assert!(!config.device_name.is_empty());
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.tcp_port, DEFAULT_TCP_PORT);
        assert!(config.open_mode);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn device_id_should_be_stable_across_loads() {
        let path = temp_config_path();
        let first = NodeConfig::load(&path).expect("first load");
        let second = NodeConfig::load(&path).expect("second load");
        assert_eq!(first.device_id, second.device_id);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn out_of_range_announce_interval_should_clamp() {
        let path = temp_config_path();
        std::fs::write(&path, br#"{"announceIntervalMs": 10}"#).expect("write");
        let config = NodeConfig::load(&path).expect("load");
        assert_eq!(config.announce_interval_ms, 500);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn share_entries_should_roundtrip() {
        let path = temp_config_path();
        let mut config = NodeConfig::load(&path).expect("load");
        config.shares.push(ShareConfig {
            share_id: Some("s-1".to_string()),
            name: Some("music".to_string()),
            path: "/srv/music".to_string(),
            read_only: true,
        });
        config.save(&path).expect("save");

        let reloaded = NodeConfig::load(&path).expect("reload");
        assert_eq!(reloaded.shares.len(), 1);
        assert_eq!(reloaded.shares[0].share_id.as_deref(), Some("s-1"));
        assert!(reloaded.shares[0].read_only);
        let _ = std::fs::remove_file(path);
    }
}
