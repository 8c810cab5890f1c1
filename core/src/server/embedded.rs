//! In-process inference server.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use super::backend::{backend_for, Backend};
use super::repository::{scan_repository, ModelConfig};
use super::{InferenceServer, ServerOptions};
use crate::error::{InferError, Result};
use crate::inference::{
    CompletionFn, InferenceRequest, InferenceResponse, OutputBuffer, OutputMeta, ResponseHeader,
    ResponseLease,
};
use crate::memory::{MemoryType, ResponseAllocator};
use crate::status::{
    ModelReadyState, ModelStatus, ModelVersionStatus, ServerReadyState, ServerStatus,
};

struct LoadedModel {
    config: ModelConfig,
    versions: BTreeMap<i64, ModelVersionStatus>,
    backend: Option<Arc<dyn Backend>>,
}

impl LoadedModel {
    fn set_all(&mut self, ready_state: ModelReadyState, reason: Option<String>) {
        for status in self.versions.values_mut() {
            status.ready_state = ready_state;
            status.reason = reason.clone();
        }
    }

    fn status(&self) -> ModelStatus {
        ModelStatus {
            config: self.config.clone(),
            version_status: self.versions.clone(),
        }
    }
}

/// A model version resolved for one request.
struct Target {
    config: ModelConfig,
    version: i64,
    backend: Arc<dyn Backend>,
}

struct ServerInner {
    id: String,
    state: RwLock<ServerReadyState>,
    models: RwLock<BTreeMap<String, LoadedModel>>,
    outstanding: Arc<AtomicUsize>,
}

/// Inference server running inside the calling process.
///
/// Creation scans the model repository and starts loading models in the
/// background: the server is live at once and ready when every model has
/// finished loading. Requests run on the server's own worker threads.
/// Dropping the server shuts it down; requests still in flight at that
/// point are abandoned and their futures report
/// [`InferError::CompletionDropped`].
pub struct EmbeddedServer {
    inner: Arc<ServerInner>,
    runtime: Option<Runtime>,
}

impl EmbeddedServer {
    pub fn new(options: ServerOptions) -> Result<Self> {
        let entries = scan_repository(&options.model_repository)?;
        info!(
            "Model repository {}: {} model(s)",
            options.model_repository.display(),
            entries.len()
        );

        let mut models = BTreeMap::new();
        for entry in entries {
            let (config, reason) = match entry.config {
                Ok(config) => (config, None),
                Err(reason) => (
                    ModelConfig {
                        name: entry.name.clone(),
                        ..ModelConfig::default()
                    },
                    Some(reason),
                ),
            };
            let versions = entry
                .versions
                .iter()
                .map(|&v| {
                    (
                        v,
                        ModelVersionStatus {
                            ready_state: ModelReadyState::Loading,
                            reason: None,
                        },
                    )
                })
                .collect();
            let mut model = LoadedModel {
                config,
                versions,
                backend: None,
            };
            if let Some(reason) = reason {
                warn!("model '{}' has an unreadable config: {}", entry.name, reason);
                model.set_all(ModelReadyState::Unavailable, Some(reason));
            }
            models.insert(entry.name, model);
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(options.worker_threads.max(1))
            .thread_name("inferbridge-worker")
            .enable_time()
            .build()?;

        let inner = Arc::new(ServerInner {
            id: options.id.clone(),
            state: RwLock::new(ServerReadyState::Initializing),
            models: RwLock::new(models),
            outstanding: Arc::new(AtomicUsize::new(0)),
        });

        let loader = Arc::clone(&inner);
        let load_delay = options.load_delay;
        runtime.spawn(async move {
            if !load_delay.is_zero() {
                tokio::time::sleep(load_delay).await;
            }
            loader.load_models();
        });

        Ok(Self {
            inner,
            runtime: Some(runtime),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Responses delivered by this server and not yet dropped.
    pub fn outstanding_responses(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Parsed form of [`InferenceServer::server_status`].
    pub fn status(&self) -> ServerStatus {
        self.inner.status(None)
    }
}

impl Drop for EmbeddedServer {
    fn drop(&mut self) {
        *self.inner.state.write() = ServerReadyState::Exiting;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("server {} destroyed", self.inner.id);
    }
}

impl ServerInner {
    fn load_models(&self) {
        let mut models = self.models.write();
        for (name, model) in models.iter_mut() {
            if model
                .versions
                .values()
                .all(|v| v.ready_state == ModelReadyState::Unavailable)
            {
                continue;
            }
            let loaded = model.config.validate().and_then(|_| {
                let backend = backend_for(&model.config.backend).ok_or_else(|| {
                    InferError::config(format!("unknown backend '{}'", model.config.backend))
                })?;
                backend.validate(&model.config)?;
                Ok(backend)
            });
            match loaded {
                Ok(backend) => {
                    info!("loaded model '{}' with backend {}", name, backend.name());
                    model.backend = Some(backend);
                    model.set_all(ModelReadyState::Ready, None);
                }
                Err(e) => {
                    warn!("failed to load model '{}': {}", name, e);
                    model.set_all(ModelReadyState::Unavailable, Some(e.to_string()));
                }
            }
        }
        drop(models);
        *self.state.write() = ServerReadyState::Ready;
        info!("server {} is ready", self.id);
    }

    fn status(&self, only: Option<&str>) -> ServerStatus {
        let models = self.models.read();
        let model_status = models
            .iter()
            .filter(|(name, _)| only.map_or(true, |o| o == name.as_str()))
            .map(|(name, model)| (name.clone(), model.status()))
            .collect();
        ServerStatus {
            id: self.id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ready_state: *self.state.read(),
            model_status,
        }
    }

    fn resolve(&self, name: &str, version: i64) -> Result<Target> {
        let models = self.models.read();
        let model = models
            .get(name)
            .ok_or_else(|| InferError::rejected(format!("unknown model '{}'", name)))?;
        let version = if version < 0 {
            model.status().latest_ready_version().ok_or_else(|| {
                InferError::rejected(format!("model '{}' has no ready version", name))
            })?
        } else {
            version
        };
        let state = model
            .versions
            .get(&version)
            .map(|v| v.ready_state)
            .ok_or_else(|| {
                InferError::rejected(format!("model '{}' has no version {}", name, version))
            })?;
        match (&model.backend, state) {
            (Some(backend), ModelReadyState::Ready) => Ok(Target {
                config: model.config.clone(),
                version,
                backend: Arc::clone(backend),
            }),
            _ => Err(InferError::rejected(format!(
                "model '{}' version {} is {}",
                name, version, state
            ))),
        }
    }

    fn execute(
        &self,
        target: &Target,
        request: &InferenceRequest,
        allocator: &Arc<dyn ResponseAllocator>,
    ) -> InferenceResponse {
        let lease = ResponseLease::acquire(&self.outstanding);
        let response = match run(target, request, allocator) {
            Ok((header, outputs)) => InferenceResponse::success(header, outputs),
            Err(e) => {
                warn!("request {} failed: {}", request.id(), e);
                InferenceResponse::failure(request.id(), e.to_string())
            }
        };
        response.with_lease(lease)
    }
}

/// Check a request against the model before accepting it.
fn validate_request(config: &ModelConfig, request: &InferenceRequest) -> Result<()> {
    let header = request.header();
    let batch_size = header.batch_size;
    let max_batch = config.max_batch_size.max(1);
    if batch_size == 0 || batch_size > max_batch {
        return Err(InferError::rejected(format!(
            "batch size {} outside 1..={} for model '{}'",
            batch_size, max_batch, config.name
        )));
    }

    for (i, input) in header.input.iter().enumerate() {
        if header.input[..i].iter().any(|prev| prev.name == input.name) {
            return Err(InferError::rejected(format!(
                "input '{}' declared twice",
                input.name
            )));
        }
        let spec = config.input(&input.name).ok_or_else(|| {
            InferError::rejected(format!(
                "unexpected input '{}' for model '{}'",
                input.name, config.name
            ))
        })?;
        if !input.dims.is_empty() && input.dims != spec.dims {
            return Err(InferError::rejected(format!(
                "input '{}' dims {:?} do not match model dims {:?}",
                input.name, input.dims, spec.dims
            )));
        }
    }

    for spec in &config.input {
        let binding = request.input(&spec.name).ok_or_else(|| {
            InferError::rejected(format!("no data attached for input '{}'", spec.name))
        })?;
        if !matches!(binding.memory_type, MemoryType::Cpu | MemoryType::CpuPinned) {
            return Err(InferError::rejected(format!(
                "input '{}' is in {} memory, only host memory is readable",
                spec.name, binding.memory_type
            )));
        }
        let expected = spec.byte_size(batch_size).ok_or_else(|| {
            InferError::rejected(format!(
                "input '{}' is too large for batch size {}",
                spec.name, batch_size
            ))
        })?;
        if binding.byte_size() != expected {
            return Err(InferError::rejected(format!(
                "input '{}' has {} bytes, expected {}",
                spec.name,
                binding.byte_size(),
                expected
            )));
        }
    }

    for (i, output) in header.output.iter().enumerate() {
        if header.output[..i].iter().any(|prev| prev.name == output.name) {
            return Err(InferError::rejected(format!(
                "output '{}' requested twice",
                output.name
            )));
        }
        if config.output(&output.name).is_none() {
            return Err(InferError::rejected(format!(
                "unknown output '{}' for model '{}'",
                output.name, config.name
            )));
        }
    }
    Ok(())
}

/// Execute the backend and place every requested output in allocator memory.
fn run(
    target: &Target,
    request: &InferenceRequest,
    allocator: &Arc<dyn ResponseAllocator>,
) -> Result<(ResponseHeader, Vec<(String, Option<OutputBuffer>)>)> {
    let header = request.header();
    let config = &target.config;
    let inputs: HashMap<_, _> = config
        .input
        .iter()
        .filter_map(|spec| request.input(&spec.name))
        .map(|binding| (binding.name.clone(), binding.data.clone()))
        .collect();

    let mut computed = target.backend.execute(config, header.batch_size, &inputs)?;

    let mut outputs = Vec::with_capacity(header.output.len());
    let mut metas = Vec::with_capacity(header.output.len());
    for requested in &header.output {
        let data = computed.remove(&requested.name).ok_or_else(|| {
            InferError::inference(format!("backend produced no '{}'", requested.name))
        })?;
        let dims = config
            .output(&requested.name)
            .map(|spec| spec.full_dims(config.max_batch_size, header.batch_size))
            .unwrap_or_default();

        let output = allocate_output(
            allocator,
            &requested.name,
            &data,
            dims.clone(),
            config.preferred_memory,
        );
        metas.push(OutputMeta {
            name: requested.name.clone(),
            byte_size: data.len(),
            dims,
        });
        outputs.push((requested.name.clone(), output));
    }

    let response_header = ResponseHeader {
        id: header.id,
        model_name: config.name.clone(),
        model_version: target.version,
        batch_size: header.batch_size,
        output: metas,
    };
    Ok((response_header, outputs))
}

/// Ask the allocator for `preferred` memory, then fall back to host memory.
///
/// Returns `None` when no call produced a buffer or the allocator failed;
/// the output is then unavailable but the request still succeeds.
fn allocate_output(
    allocator: &Arc<dyn ResponseAllocator>,
    name: &str,
    data: &[u8],
    dims: Vec<i64>,
    preferred: MemoryType,
) -> Option<OutputBuffer> {
    let byte_size = data.len();
    let mut candidates = vec![preferred];
    if preferred != MemoryType::Cpu {
        candidates.push(MemoryType::Cpu);
    }

    for memory_type in candidates {
        let allocation = match allocator.allocate(name, byte_size, memory_type, 0) {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(
                    "output '{}' is unavailable: allocating {} bytes in {} memory failed: {}",
                    name, byte_size, memory_type, e
                );
                return None;
            }
        };

        if byte_size == 0 || allocation.buffer.is_some() {
            let mut output = OutputBuffer::new(
                name,
                allocation,
                byte_size,
                memory_type,
                0,
                dims,
                Arc::clone(allocator),
            );
            // A failed fill drops `output`, which releases it.
            if let Err(e) = output.fill(data) {
                warn!("output '{}' is unavailable: {}", name, e);
                return None;
            }
            return Some(output);
        }

        if allocation.needs_release() {
            if let Err(e) = allocator.release(None, allocation.context, byte_size, memory_type, 0)
            {
                warn!("failed to release unused context for '{}': {}", name, e);
            }
        }
        debug!(
            "no {} buffer for '{}' ({} bytes), negotiating",
            memory_type, name, byte_size
        );
    }

    warn!("output '{}' is unavailable: allocator returned no buffer", name);
    None
}

impl InferenceServer for EmbeddedServer {
    fn is_live(&self) -> Result<bool> {
        Ok(!matches!(
            *self.inner.state.read(),
            ServerReadyState::Exiting | ServerReadyState::FailedToInitialize
        ))
    }

    fn is_ready(&self) -> Result<bool> {
        Ok(*self.inner.state.read() == ServerReadyState::Ready)
    }

    fn server_status(&self) -> Result<Vec<u8>> {
        self.inner.status(None).to_vec()
    }

    fn model_status(&self, model_name: &str) -> Result<Vec<u8>> {
        let status = self.inner.status(Some(model_name));
        if status.model_status.is_empty() {
            return Err(InferError::ModelNotFound(model_name.to_string()));
        }
        status.to_vec()
    }

    fn infer_async(
        &self,
        request: InferenceRequest,
        allocator: Arc<dyn ResponseAllocator>,
        on_complete: CompletionFn,
    ) -> Result<()> {
        if !self.is_ready()? {
            return Err(InferError::rejected("server is not ready"));
        }
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| InferError::rejected("server is shutting down"))?;

        let missing = request.missing_inputs();
        if !missing.is_empty() {
            return Err(InferError::rejected(format!(
                "no data attached for input(s) {:?}",
                missing
            )));
        }
        let target = self
            .inner
            .resolve(request.model_name(), request.model_version())?;
        validate_request(&target.config, &request)?;

        debug!(
            "accepted request {} for '{}' version {}",
            request.id(),
            target.config.name,
            target.version
        );
        let inner = Arc::clone(&self.inner);
        runtime.spawn_blocking(move || {
            let response = inner.execute(&target, &request, &allocator);
            drop(request);
            debug!("request {} complete", response.id());
            on_complete(response);
        });
        Ok(())
    }
}
