//! Model repository layout and per-model configuration.
//!
//! ```text
//! <repository>/
//!   simple/
//!     config.yaml
//!     1/
//! ```
//!
//! Numeric subdirectories are versions; a model without any is version 1.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{InferError, Result};
use crate::inference::DataType;
use crate::memory::MemoryType;

/// Name of the per-model configuration file.
pub const MODEL_CONFIG_FILE: &str = "config.yaml";

/// Shape and type of one model input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub data_type: DataType,
    /// Shape without the batch dimension.
    pub dims: Vec<i64>,
}

impl TensorSpec {
    /// Shape including the batch dimension when the model batches.
    pub fn full_dims(&self, max_batch_size: u32, batch_size: u32) -> Vec<i64> {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        if max_batch_size > 0 {
            dims.push(i64::from(batch_size));
        }
        dims.extend_from_slice(&self.dims);
        dims
    }

    /// Byte size of the tensor for `batch_size` batches.
    ///
    /// `None` if a dim is negative or the size does not fit in `usize`.
    pub fn byte_size(&self, batch_size: u32) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))?
            .checked_mul(usize::try_from(batch_size).ok()?)?
            .checked_mul(self.data_type.size())
    }
}

/// Configuration of one model, read from its `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Defaults to the model's directory name.
    #[serde(default)]
    pub name: String,

    /// Backend that executes the model.
    #[serde(default)]
    pub backend: String,

    /// Largest accepted batch; 0 means the model does not batch.
    #[serde(default)]
    pub max_batch_size: u32,

    #[serde(default)]
    pub input: Vec<TensorSpec>,

    #[serde(default)]
    pub output: Vec<TensorSpec>,

    /// Memory type requested from the response allocator first.
    #[serde(default)]
    pub preferred_memory: MemoryType,
}

impl ModelConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(InferError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ModelConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.input.iter().find(|t| t.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.output.iter().find(|t| t.name == name)
    }

    /// Check the parts of the config every backend relies on.
    pub fn validate(&self) -> Result<()> {
        for spec in self.input.iter().chain(&self.output) {
            if spec.dims.iter().any(|&d| d < 0) {
                return Err(InferError::config(format!(
                    "tensor '{}' of model '{}' has variable dims {:?}",
                    spec.name, self.name, spec.dims
                )));
            }
            if spec.byte_size(self.max_batch_size.max(1)).is_none() {
                return Err(InferError::config(format!(
                    "tensor '{}' of model '{}' is too large: dims {:?}, max batch {}",
                    spec.name, self.name, spec.dims, self.max_batch_size
                )));
            }
        }
        Ok(())
    }
}

/// A model directory found in the repository.
#[derive(Debug)]
pub struct RepositoryEntry {
    pub name: String,
    /// Parsed config, or the reason it could not be read.
    pub config: std::result::Result<ModelConfig, String>,
    pub versions: Vec<i64>,
}

/// List the models in a repository directory, sorted by name.
pub fn scan_repository(path: &Path) -> Result<Vec<RepositoryEntry>> {
    if !path.is_dir() {
        return Err(InferError::FileNotFound(path.to_path_buf()));
    }

    let mut entries = Vec::new();
    for dir in fs::read_dir(path)? {
        let dir = dir?.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            warn!("skipping model directory with non-UTF-8 name: {}", dir.display());
            continue;
        };

        let config_path = dir.join(MODEL_CONFIG_FILE);
        if !config_path.exists() {
            debug!("skipping '{}': no {}", name, MODEL_CONFIG_FILE);
            continue;
        }

        let config = ModelConfig::from_yaml_file(&config_path)
            .map(|mut config| {
                if config.name.is_empty() {
                    config.name = name.clone();
                }
                config
            })
            .map_err(|e| e.to_string());

        let mut versions = Vec::new();
        for version in fs::read_dir(&dir)? {
            let version = version?.path();
            if !version.is_dir() {
                continue;
            }
            if let Some(v) = version
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok())
                .filter(|&v| v > 0)
            {
                versions.push(v);
            }
        }
        if versions.is_empty() {
            versions.push(1);
        }
        versions.sort_unstable();

        entries.push(RepositoryEntry {
            name,
            config,
            versions,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
