//! Configuration types for inferbridge-rs.

use serde::Deserialize;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Embedded server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Readiness gate configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Model the client targets.
    #[serde(default)]
    pub model: ModelTarget,
}

/// Embedded server configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Path to the model repository.
    #[serde(default)]
    pub model_repository: Option<PathBuf>,

    /// Threads executing requests.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Simulated model load time in milliseconds.
    #[serde(default)]
    pub load_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_repository: None,
            worker_threads: default_worker_threads(),
            load_delay_ms: 0,
        }
    }
}

/// Readiness gate configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Probes before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between probes in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

/// Model the client targets.
#[derive(Debug, Deserialize)]
pub struct ModelTarget {
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Version to wait for and run.
    #[serde(default = "default_model_version")]
    pub version: i64,
}

impl Default for ModelTarget {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            version: default_model_version(),
        }
    }
}

fn default_worker_threads() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    10
}

fn default_interval_ms() -> u64 {
    500
}

fn default_model_name() -> String {
    "simple".to_string()
}

fn default_model_version() -> i64 {
    1
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> crate::error::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}
