use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::types::{DiscoveryConfig, DiscoveryMode};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Owner of everything this bridge's scans register
    pub supervisor_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
}

/// Startup discovery settings. The mode and model can be replaced at
/// runtime through the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverySection {
    #[serde(default)]
    pub mode: DiscoveryMode,
    #[serde(flatten)]
    pub config: DiscoveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Disabled records not seen for this long are deleted
    #[serde(default = "default_purge_after")]
    pub purge_after_secs: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    #[serde(default = "default_mdns_enabled")]
    pub enabled: bool,
    /// Restrict multicast to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ua-discovery/registry.db")
}

fn default_purge_after() -> u64 {
    7 * 24 * 3600
}

fn default_purge_interval() -> u64 {
    3600
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_page_size() -> usize {
    100
}

fn default_max_page_size() -> usize {
    1000
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_mdns_enabled() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            purge_after_secs: default_purge_after(),
            purge_interval_secs: default_purge_interval(),
            conflict_retries: default_conflict_retries(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_mdns_enabled(),
            interface: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}
