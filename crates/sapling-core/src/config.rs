//! Configuration loading and typed config structures for the Sapling engine.
//!
//! The canonical configuration lives in `sapling-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure, and provides a loader that reads the file and applies
//! environment overrides. Every field has a default, so an empty file is a
//! valid configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
///
/// Mirrors the structure of `sapling-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Session execution settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Snapshot store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply environment
    /// overrides.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override settings with environment variables when set.
    ///
    /// `SAPLING_STORE_DIR` sets the file store directory; `SAPLING_LOG_LEVEL`
    /// sets the log level.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SAPLING_STORE_DIR") {
            self.store.directory = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SAPLING_LOG_LEVEL") {
            self.logging.level = val;
        }
    }
}

/// Session execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// Maximum model round-trips per execution.
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,

    /// Maximum compile passes per `compile_until_stable`.
    #[serde(default = "default_max_compile_iterations")]
    pub max_compile_iterations: u32,

    /// Save a snapshot every N completed ticks (0 disables).
    #[serde(default)]
    pub snapshot_every_ticks: u64,

    /// Start a new execution when messages were queued during one.
    #[serde(default = "default_true")]
    pub auto_resume: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_ticks: default_max_ticks(),
            max_compile_iterations: default_max_compile_iterations(),
            snapshot_every_ticks: 0,
            auto_resume: true,
        }
    }
}

/// Which snapshot store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process LRU map.
    #[default]
    Memory,
    /// One JSON file per session.
    File,
}

/// Snapshot store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Maximum snapshots kept by the memory backend (0 = unbounded).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Directory of the file backend.
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            max_entries: default_max_entries(),
            directory: default_store_directory(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG`
    /// is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

const fn default_max_ticks() -> u32 {
    10
}

const fn default_max_compile_iterations() -> u32 {
    8
}

const fn default_true() -> bool {
    true
}

const fn default_max_entries() -> usize {
    128
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_log_level() -> String {
    String::from("info")
}
