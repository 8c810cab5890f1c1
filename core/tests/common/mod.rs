#![allow(dead_code)]

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use inferbridge_rs::memory::{Allocation, Buffer, BufferContext};
use inferbridge_rs::{
    EmbeddedServer, InferError, MemoryType, ReadinessPoller, ResponseAllocator, ServerOptions,
};

pub const SIMPLE: &str = r#"
backend: add_sub
max_batch_size: 8
input:
  - { name: INPUT0, data_type: INT32, dims: [16] }
  - { name: INPUT1, data_type: INT32, dims: [16] }
output:
  - { name: OUTPUT0, data_type: INT32, dims: [16] }
  - { name: OUTPUT1, data_type: INT32, dims: [16] }
"#;

pub const SIMPLE_ON_GPU: &str = r#"
backend: add_sub
input:
  - { name: INPUT0, data_type: INT32, dims: [16] }
  - { name: INPUT1, data_type: INT32, dims: [16] }
output:
  - { name: OUTPUT0, data_type: INT32, dims: [16] }
  - { name: OUTPUT1, data_type: INT32, dims: [16] }
preferred_memory: gpu
"#;

pub const EMPTY: &str = r#"
backend: identity
input:
  - { name: IN, data_type: FP32, dims: [0] }
output:
  - { name: OUT, data_type: FP32, dims: [0] }
"#;

/// Lay out a model repository with the given `(name, config.yaml)` pairs.
pub fn repository(models: &[(&str, &str)]) -> Result<TempDir> {
    let repo = tempfile::tempdir()?;
    for (name, config) in models {
        let dir = repo.path().join(name);
        fs::create_dir_all(dir.join("1"))?;
        fs::write(dir.join("config.yaml"), config)?;
    }
    Ok(repo)
}

/// Start a server on `repo` and wait until `models` are ready.
pub fn ready_server(repo: &TempDir, models: &[&str]) -> Result<EmbeddedServer> {
    let server = EmbeddedServer::new(ServerOptions::new(repo.path()))?;
    let poller = ReadinessPoller::new(100, Duration::from_millis(10));
    poller.wait_for_server(&server)?;
    for model in models {
        poller.wait_for_model(&server, model, 1)?;
    }
    Ok(server)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub tensor: String,
    pub byte_size: usize,
    pub memory_type: MemoryType,
    pub had_buffer: bool,
}

/// Allocator that serves a fixed set of memory types and records every call.
pub struct RecordingAllocator {
    supported: Vec<MemoryType>,
    fail_tensor: Option<String>,
    next_id: Mutex<u64>,
    pub allocations: Mutex<Vec<Call>>,
    pub releases: Mutex<Vec<Call>>,
}

impl RecordingAllocator {
    pub fn new(supported: &[MemoryType]) -> Self {
        Self {
            supported: supported.to_vec(),
            fail_tensor: None,
            next_id: Mutex::new(0),
            allocations: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(tensor: &str) -> Self {
        Self {
            fail_tensor: Some(tensor.to_string()),
            ..Self::new(&[MemoryType::Cpu])
        }
    }

    /// Allocations that owe a release.
    pub fn owed(&self) -> Vec<Call> {
        self.allocations
            .lock()
            .iter()
            .filter(|c| c.had_buffer || c.byte_size == 0)
            .cloned()
            .collect()
    }

    /// Check every owed allocation was released exactly once with the same
    /// size and memory type.
    pub fn assert_paired(&self) -> Result<()> {
        let mut owed = self.owed();
        let mut released: Vec<Call> = self
            .releases
            .lock()
            .iter()
            .map(|c| Call {
                had_buffer: false,
                ..c.clone()
            })
            .collect();
        for call in owed.iter_mut() {
            call.had_buffer = false;
        }
        owed.sort_by(|a, b| a.tensor.cmp(&b.tensor));
        released.sort_by(|a, b| a.tensor.cmp(&b.tensor));
        if owed != released {
            bail!("allocations {:?} do not pair with releases {:?}", owed, released);
        }
        Ok(())
    }
}

impl ResponseAllocator for RecordingAllocator {
    fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        memory_type: MemoryType,
        memory_type_id: i64,
    ) -> inferbridge_rs::Result<Allocation> {
        if self.fail_tensor.as_deref() == Some(tensor_name) {
            return Err(InferError::usage("allocator refuses this tensor"));
        }
        let supported = self.supported.contains(&memory_type);
        self.allocations.lock().push(Call {
            tensor: tensor_name.to_string(),
            byte_size,
            memory_type,
            had_buffer: supported && byte_size > 0,
        });

        if byte_size == 0 {
            let mut id = self.next_id.lock();
            *id += 1;
            return Ok(Allocation::empty(BufferContext::new(*id, tensor_name)));
        }
        if !supported {
            return Ok(Allocation::unavailable());
        }
        let mut id = self.next_id.lock();
        *id += 1;
        Ok(Allocation::new(
            Buffer::zeroed(byte_size, memory_type, memory_type_id),
            BufferContext::new(*id, tensor_name),
        ))
    }

    fn release(
        &self,
        _buffer: Option<Buffer>,
        context: Option<BufferContext>,
        byte_size: usize,
        memory_type: MemoryType,
        _memory_type_id: i64,
    ) -> inferbridge_rs::Result<()> {
        let context = context.unwrap_or_else(BufferContext::unknown);
        self.releases.lock().push(Call {
            tensor: context.tensor_name,
            byte_size,
            memory_type,
            had_buffer: false,
        });
        Ok(())
    }
}
