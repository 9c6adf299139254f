//! Unified configuration system for stitchgraph runs.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (stitchgraph.toml)
//! ```toml
//! [run]
//! process_date = "2024-03-01"
//! full_rebuild = false
//!
//! [storage]
//! data_dir = "/var/lib/stitchgraph"
//!
//! [io]
//! events = "/data/events/2024-03-01.jsonl"
//! output = "/data/stamped/2024-03-01.jsonl"
//! ```
//!
//! Environment variables use the `STITCH_` prefix with `__` between section
//! and key, e.g. `STITCH_RUN__FULL_REBUILD=true`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a resolution run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Run parameters
    pub run: RunConfig,
    /// Identity-graph storage
    pub storage: StorageConfig,
    /// Event input and output locations
    pub io: IoConfig,
}

impl StitchConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(StitchConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("STITCH_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Run parameters: the only knobs the resolution core itself exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Processing date (`YYYY-MM-DD`, UTC); yesterday when unset
    pub process_date: Option<String>,
    /// Reprocess a long lookback instead of the single processing day
    pub full_rebuild: bool,
    /// Days covered by a full rebuild
    pub rebuild_lookback_days: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            process_date: None,
            full_rebuild: false,
            rebuild_lookback_days: DEFAULT_REBUILD_LOOKBACK_DAYS,
        }
    }
}

/// RocksDB storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; an in-memory graph is used when unset
    pub data_dir: Option<PathBuf>,
    /// Identity links held in the read cache
    pub cache_capacity: usize,
    /// Run repair on open
    pub repair: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_capacity: DEFAULT_LINK_CACHE_CAPACITY,
            repair: false,
        }
    }
}

/// Where events are read from and stamped events written to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// JSON Lines file of input events
    pub events: Option<PathBuf>,
    /// JSON Lines file receiving stamped events
    pub output: Option<PathBuf>,
    /// Optional Graphviz export of touched clusters
    pub dot: Option<PathBuf>,
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io: Option<IoOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_rebuild: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild_lookback_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IoOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dot: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
