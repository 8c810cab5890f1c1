//! Server and model status messages.
//!
//! The server hands status out as serialized bytes; callers parse them
//! back with [`ServerStatus::from_slice`] and query by model and version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{InferError, Result};
use crate::server::ModelConfig;

/// Readiness of the server as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerReadyState {
    #[default]
    Invalid,
    Initializing,
    Ready,
    Exiting,
    FailedToInitialize,
}

/// Readiness of one model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelReadyState {
    #[default]
    Unknown,
    Ready,
    Unavailable,
    Loading,
    Unloading,
}

impl fmt::Display for ModelReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "MODEL_UNKNOWN",
            Self::Ready => "MODEL_READY",
            Self::Unavailable => "MODEL_UNAVAILABLE",
            Self::Loading => "MODEL_LOADING",
            Self::Unloading => "MODEL_UNLOADING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionStatus {
    pub ready_state: ModelReadyState,
    /// Why the version is not ready, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub config: ModelConfig,
    pub version_status: BTreeMap<i64, ModelVersionStatus>,
}

impl ModelStatus {
    /// Highest version currently in the ready state.
    pub fn latest_ready_version(&self) -> Option<i64> {
        self.version_status
            .iter()
            .rev()
            .find(|(_, status)| status.ready_state == ModelReadyState::Ready)
            .map(|(version, _)| *version)
    }
}

/// Status document for the server, or for a single model when produced
/// by a per-model query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub id: String,
    pub version: String,
    pub ready_state: ServerReadyState,
    #[serde(default)]
    pub model_status: BTreeMap<String, ModelStatus>,
}

impl ServerStatus {
    /// Parse a serialized status message.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| InferError::status(format!("failed to parse status: {}", e)))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn model(&self, name: &str) -> Result<&ModelStatus> {
        self.model_status
            .get(name)
            .ok_or_else(|| InferError::ModelNotFound(format!("no status for model '{}'", name)))
    }

    /// Ready state of `version` of model `name`.
    pub fn version_state(&self, name: &str, version: i64) -> Result<ModelReadyState> {
        self.model(name)?
            .version_status
            .get(&version)
            .map(|status| status.ready_state)
            .ok_or_else(|| {
                InferError::ModelNotFound(format!(
                    "no version {} status for model '{}'",
                    version, name
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerStatus {
        let config = ModelConfig::from_yaml_str(
            r#"
name: simple
backend: add_sub
input:
  - { name: INPUT0, data_type: INT32, dims: [16] }
  - { name: INPUT1, data_type: INT32, dims: [16] }
output:
  - { name: OUTPUT0, data_type: INT32, dims: [16] }
  - { name: OUTPUT1, data_type: INT32, dims: [16] }
"#,
        )
        .unwrap();

        let mut version_status = BTreeMap::new();
        version_status.insert(
            1,
            ModelVersionStatus {
                ready_state: ModelReadyState::Ready,
                reason: None,
            },
        );
        version_status.insert(
            2,
            ModelVersionStatus {
                ready_state: ModelReadyState::Loading,
                reason: None,
            },
        );

        let mut model_status = BTreeMap::new();
        model_status.insert(
            "simple".to_string(),
            ModelStatus {
                config,
                version_status,
            },
        );
        ServerStatus {
            id: "inference:0".to_string(),
            version: "0.1.0".to_string(),
            ready_state: ServerReadyState::Ready,
            model_status,
        }
    }

    #[test]
    fn test_query_by_model_and_version() {
        let status = ServerStatus::from_slice(&sample().to_vec().unwrap()).unwrap();
        assert_eq!(status.version_state("simple", 1).unwrap(), ModelReadyState::Ready);
        assert_eq!(status.version_state("simple", 2).unwrap(), ModelReadyState::Loading);
        assert_eq!(status.model("simple").unwrap().latest_ready_version(), Some(1));
    }

    #[test]
    fn test_missing_model_or_version() {
        let status = sample();
        assert!(matches!(
            status.version_state("other", 1),
            Err(InferError::ModelNotFound(_))
        ));
        assert!(matches!(
            status.version_state("simple", 7),
            Err(InferError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_garbage_is_a_status_error() {
        assert!(matches!(
            ServerStatus::from_slice(b"not a status"),
            Err(InferError::Status(_))
        ));
    }

    #[test]
    fn test_ready_state_names() {
        assert_eq!(ModelReadyState::Ready.to_string(), "MODEL_READY");
        assert_eq!(
            serde_json::to_string(&ModelReadyState::Unavailable).unwrap(),
            "\"UNAVAILABLE\""
        );
    }
}
