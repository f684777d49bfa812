//! Configuration schema and loader for needlestore nodes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Compaction settings.
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Catalog (metadata store) settings.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage: StorageConfig::default(),
            compaction: CompactionConfig::default(),
            catalog: CatalogConfig::default(),
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for volume files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Maximum size of a single volume file in bytes.
    #[serde(default = "default_max_volume_size")]
    pub max_volume_size: u64,

    /// How often volumes are fsynced, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Reject all mutating operations when set.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_volume_size: default_max_volume_size(),
            sync_interval_secs: default_sync_interval_secs(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Whether the background compactor runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between compaction sweeps.
    #[serde(default = "default_compaction_interval_secs")]
    pub interval_secs: u64,

    /// Fraction of tombstoned needles (0..1) above which a volume is rewritten.
    #[serde(default = "default_deleted_threshold")]
    pub deleted_threshold: f64,

    /// Volumes smaller than this are never considered.
    #[serde(default = "default_min_volume_size")]
    pub min_volume_size: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_compaction_interval_secs(),
            deleted_threshold: default_deleted_threshold(),
            min_volume_size: default_min_volume_size(),
        }
    }
}

/// Which catalog engine backs the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogEngine {
    /// Embedded SQLite file.
    Sqlite,
    /// In-process map, lost on restart. For tests and ephemeral runs.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Engine selection.
    #[serde(default = "default_catalog_engine")]
    pub engine: CatalogEngine,

    /// Database file path (sqlite engine only).
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            engine: default_catalog_engine(),
            path: default_catalog_path(),
        }
    }
}

// --- Defaults ---

fn default_listen() -> SocketAddr {
    "127.0.0.1:8080".parse().expect("default listen address")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_max_volume_size() -> u64 {
    1 << 30 // 1 GiB
}
fn default_sync_interval_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_compaction_interval_secs() -> u64 {
    3600
}
fn default_deleted_threshold() -> f64 {
    0.3
}
fn default_min_volume_size() -> u64 {
    10 * 1024 * 1024
}
fn default_catalog_engine() -> CatalogEngine {
    CatalogEngine::Sqlite
}
fn default_catalog_path() -> PathBuf {
    PathBuf::from("data/needlestore.db")
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_volume_size == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_volume_size must be > 0".into(),
            ));
        }
        if self.storage.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "storage.sync_interval_secs must be > 0".into(),
            ));
        }
        if self.compaction.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "compaction.interval_secs must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction.deleted_threshold) {
            return Err(ConfigError::Invalid(format!(
                "compaction.deleted_threshold ({}) must be within 0..=1",
                self.compaction.deleted_threshold
            )));
        }
        if self.catalog.engine == CatalogEngine::Sqlite && self.catalog.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "catalog.path must be set for the sqlite engine".into(),
            ));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: NodeConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
