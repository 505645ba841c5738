//! Player/recorder configuration.
//!
//! Read from `config.json` in the platform config directory, with command
//! line flags layered on top.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::network::{self, MulticastTarget};

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 2, 3);
pub const DEFAULT_PORT: u32 = 3000;
/// Capture ceiling, 16 MiB
pub const DEFAULT_SIZE_LIMIT: u64 = 0x100_0000;
pub const DEFAULT_FAST_INTERVAL_MS: u64 = 10;
pub const DEFAULT_TTL: u32 = 1;

const CONFIG_FILE: &str = "config.json";

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "dispr", "dispr")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub group: Ipv4Addr,
    /// Kept wide so an out-of-range value is reported, not truncated
    pub port: u32,
    pub interface: Option<String>,
    pub size_limit: u64,
    pub fast_interval_ms: u64,
    pub ttl: u32,
    pub capture_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: None,
            size_limit: DEFAULT_SIZE_LIMIT,
            fast_interval_ms: DEFAULT_FAST_INTERVAL_MS,
            ttl: DEFAULT_TTL,
            capture_dir: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `config.json` from the platform config directory, or the defaults
    /// when there is no such file.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        get_project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn target(&self) -> Result<MulticastTarget> {
        MulticastTarget::new(self.group, self.port)
    }

    pub fn interface_addr(&self) -> Result<Ipv4Addr> {
        network::resolve_interface(self.interface.as_deref())
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.capture_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
