//! Inference server API surface and an in-process implementation.
//!
//! [`InferenceServer`] is everything a client needs from a server: health,
//! status, and asynchronous submission. [`EmbeddedServer`] serves a model
//! repository from inside the calling process.

mod backend;
mod embedded;
mod repository;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use backend::{backend_for, AddSubBackend, Backend, IdentityBackend};
pub use embedded::EmbeddedServer;
pub use repository::{scan_repository, ModelConfig, RepositoryEntry, TensorSpec};

use crate::config::Config;
use crate::error::{InferError, Result};
use crate::inference::{CompletionFn, InferenceRequest};
use crate::memory::ResponseAllocator;

/// Operations a client performs against a running inference server.
pub trait InferenceServer: Send + Sync {
    /// Whether the server process is up, possibly still initializing.
    fn is_live(&self) -> Result<bool>;

    /// Whether the server accepts requests.
    fn is_ready(&self) -> Result<bool>;

    /// Serialized [`ServerStatus`](crate::status::ServerStatus) for all models.
    fn server_status(&self) -> Result<Vec<u8>>;

    /// Serialized [`ServerStatus`](crate::status::ServerStatus) holding only `model_name`.
    fn model_status(&self, model_name: &str) -> Result<Vec<u8>>;

    /// Submit a request without waiting for it.
    ///
    /// An `Err` means the request was rejected and `on_complete` will not
    /// run. An `Ok` means it was accepted: output buffers are requested
    /// from `allocator` and `on_complete` then runs exactly once.
    fn infer_async(
        &self,
        request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
        on_complete: CompletionFn,
    ) -> Result<()>;
}

/// Options used to create an [`EmbeddedServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub id: String,
    pub model_repository: PathBuf,
    /// Threads executing requests.
    pub worker_threads: usize,
    /// Simulated per-server model load time.
    pub load_delay: Duration,
}

impl ServerOptions {
    pub fn new(model_repository: impl Into<PathBuf>) -> Self {
        Self {
            id: "inference:0".to_string(),
            model_repository: model_repository.into(),
            worker_threads: 2,
            load_delay: Duration::ZERO,
        }
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_load_delay(mut self, load_delay: Duration) -> Self {
        self.load_delay = load_delay;
        self
    }

    /// Build options from the `server` section of a [`Config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let repository = config.server.model_repository.clone().ok_or_else(|| {
            InferError::usage("-r must be used to specify model repository path")
        })?;
        Ok(Self::new(repository)
            .with_worker_threads(config.server.worker_threads)
            .with_load_delay(Duration::from_millis(config.server.load_delay_ms)))
    }
}
