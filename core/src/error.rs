//! Error types for inferbridge-rs.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for inferbridge-rs operations.
pub type Result<T> = std::result::Result<T, InferError>;

/// Coarse classification of an [`InferError`].
///
/// Callers that keep issuing requests after a failure branch on this
/// rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The service rejected or failed an operation.
    Service,
    /// The caller used the API incorrectly.
    Usage,
    /// Returned data does not match what the caller expected.
    DataIntegrity,
    /// A response allocator could not provide a buffer.
    Allocation,
    /// The service or a model never reached a serving state.
    Readiness,
    /// Startup configuration is missing or malformed.
    Config,
}

/// Errors that can occur while talking to an inference server.
#[derive(Debug, Error)]
pub enum InferError {
    /// The API was called incorrectly.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server refused a submission synchronously.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The response carried a failure status.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// A response allocator returned an error.
    #[error("Allocation failed for '{tensor}': {reason}")]
    Allocation { tensor: String, reason: String },

    /// Output lookup by a name the request never declared.
    #[error("Unknown output '{0}': not declared in the request header")]
    UnknownOutput(String),

    /// Output was declared but no buffer could be allocated for it.
    #[error("Output '{0}' is unavailable: no buffer was allocated")]
    OutputUnavailable(String),

    /// Returned output does not match expectations.
    #[error("Unexpected {what} for '{tensor}': expected {expected}, got {actual}")]
    DataIntegrity {
        tensor: String,
        what: String,
        expected: String,
        actual: String,
    },

    /// Server did not become live and ready in time.
    #[error("Server not ready after {attempts} attempts")]
    ServerNotReady { attempts: u32 },

    /// Model version did not become ready in time.
    #[error("Model '{model}' version {version} not ready after {attempts} attempts")]
    ModelNotReady {
        model: String,
        version: i64,
        attempts: u32,
    },

    /// Model or model version is not known to the server.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Status message could not be produced or parsed.
    #[error("Status error: {0}")]
    Status(String),

    /// The completion notification was dropped without firing.
    #[error("Completion for request {0} was dropped before it fired")]
    CompletionDropped(u64),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl InferError {
    /// Create a usage error.
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a submission rejection.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create an inference error.
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a status error.
    pub fn status(msg: impl Into<String>) -> Self {
        Self::Status(msg.into())
    }

    /// Create a data-integrity error.
    pub fn data_integrity(
        tensor: impl Into<String>,
        what: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::DataIntegrity {
            tensor: tensor.into(),
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Usage(_) | Self::UnknownOutput(_) => ErrorCategory::Usage,
            Self::DataIntegrity { .. } => ErrorCategory::DataIntegrity,
            Self::Allocation { .. } | Self::OutputUnavailable(_) => ErrorCategory::Allocation,
            Self::ServerNotReady { .. } | Self::ModelNotReady { .. } => ErrorCategory::Readiness,
            Self::Config(_) | Self::Yaml(_) | Self::FileNotFound(_) => ErrorCategory::Config,
            Self::Rejected(_)
            | Self::Inference(_)
            | Self::ModelNotFound(_)
            | Self::Status(_)
            | Self::CompletionDropped(_)
            | Self::Json(_)
            | Self::Io(_) => ErrorCategory::Service,
        }
    }
}
