//! Result-buffer allocation.
//!
//! The server never owns memory for result tensors. For every output it
//! asks a caller-supplied [`ResponseAllocator`] for a buffer in a given
//! [`MemoryType`], and hands the buffer back to the same allocator exactly
//! once when the caller drops the output.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::error::{InferError, Result};

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Host-addressable memory.
    #[default]
    Cpu,
    /// Page-locked host memory.
    CpuPinned,
    /// Device memory.
    Gpu,
}

impl FromStr for MemoryType {
    type Err = InferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cpu_pinned" => Ok(Self::CpuPinned),
            "gpu" => Ok(Self::Gpu),
            other => Err(InferError::config(format!("Invalid memory type: {}", other))),
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::CpuPinned => write!(f, "cpu_pinned"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Per-buffer identity recorded at allocation and returned at release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferContext {
    /// Allocator-assigned id.
    pub id: u64,
    /// Tensor the buffer was allocated for.
    pub tensor_name: String,
}

impl BufferContext {
    pub fn new(id: u64, tensor_name: impl Into<String>) -> Self {
        Self {
            id,
            tensor_name: tensor_name.into(),
        }
    }

    /// Stand-in identity used when a release arrives without a context.
    pub fn unknown() -> Self {
        Self::new(0, "<unknown>")
    }
}

/// A block of memory handed out by an allocator.
pub struct Buffer {
    data: Box<[u8]>,
    memory_type: MemoryType,
    memory_type_id: i64,
}

impl Buffer {
    /// Allocate a zero-filled buffer tagged with the given memory type.
    pub fn zeroed(byte_size: usize, memory_type: MemoryType, memory_type_id: i64) -> Self {
        Self {
            data: vec![0u8; byte_size].into_boxed_slice(),
            memory_type,
            memory_type_id,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn memory_type_id(&self) -> i64 {
        self.memory_type_id
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("memory_type", &self.memory_type)
            .field("memory_type_id", &self.memory_type_id)
            .finish()
    }
}

/// Outcome of a single allocation call.
///
/// A missing buffer is not an error. With a zero byte size it means no
/// memory was needed; otherwise the requested memory type could not be
/// served and the server may try again with another type.
#[derive(Debug, Default)]
pub struct Allocation {
    pub buffer: Option<Buffer>,
    pub context: Option<BufferContext>,
}

impl Allocation {
    pub fn new(buffer: Buffer, context: BufferContext) -> Self {
        Self {
            buffer: Some(buffer),
            context: Some(context),
        }
    }

    /// No buffer, no context: the memory type is not supported.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// No buffer because none was needed, but the identity is still tracked.
    pub fn empty(context: BufferContext) -> Self {
        Self {
            buffer: None,
            context: Some(context),
        }
    }

    /// Whether the allocator expects a matching release call.
    pub fn needs_release(&self) -> bool {
        self.buffer.is_some() || self.context.is_some()
    }
}

/// Supplies and reclaims result-tensor memory on behalf of the server.
///
/// The server may call these methods concurrently for different in-flight
/// requests, hence the `Send + Sync` bound. Every allocation for which
/// [`Allocation::needs_release`] is true receives exactly one `release`
/// call with the same byte size and memory type, possibly after the
/// request's completion has already fired.
pub trait ResponseAllocator: Send + Sync {
    /// Provide a buffer of `byte_size` bytes in `memory_type` for `tensor_name`.
    fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        memory_type: MemoryType,
        memory_type_id: i64,
    ) -> Result<Allocation>;

    /// Reclaim a buffer previously returned by [`allocate`](Self::allocate).
    fn release(
        &self,
        buffer: Option<Buffer>,
        context: Option<BufferContext>,
        byte_size: usize,
        memory_type: MemoryType,
        memory_type_id: i64,
    ) -> Result<()>;
}

/// Counters kept by [`CpuAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub releases: u64,
    pub refused: u64,
}

/// Allocator that serves host memory only.
///
/// Requests for any other memory type get [`Allocation::unavailable`].
#[derive(Debug, Default)]
pub struct CpuAllocator {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, (String, usize)>>,
    stats: Mutex<AllocatorStats>,
}

impl CpuAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers handed out and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.live.lock().len()
    }

    pub fn stats(&self) -> AllocatorStats {
        *self.stats.lock()
    }
}

impl ResponseAllocator for CpuAllocator {
    fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        memory_type: MemoryType,
        memory_type_id: i64,
    ) -> Result<Allocation> {
        if byte_size != 0 && memory_type != MemoryType::Cpu {
            self.stats.lock().refused += 1;
            info!(
                "failed to allocate {} bytes in {} memory for result tensor {}",
                byte_size, memory_type, tensor_name
            );
            return Ok(Allocation::unavailable());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let context = BufferContext::new(id, tensor_name);
        self.live
            .lock()
            .insert(id, (tensor_name.to_string(), byte_size));
        self.stats.lock().allocations += 1;
        info!(
            "allocated {} bytes for result tensor {}",
            byte_size, tensor_name
        );

        if byte_size == 0 {
            return Ok(Allocation::empty(context));
        }
        Ok(Allocation::new(
            Buffer::zeroed(byte_size, MemoryType::Cpu, memory_type_id),
            context,
        ))
    }

    fn release(
        &self,
        buffer: Option<Buffer>,
        context: Option<BufferContext>,
        byte_size: usize,
        memory_type: MemoryType,
        _memory_type_id: i64,
    ) -> Result<()> {
        let context = context.unwrap_or_else(BufferContext::unknown);
        let ptr = buffer
            .as_ref()
            .map_or(std::ptr::null(), |b| b.as_ptr());
        info!(
            "Releasing buffer {:?} of size {} in {} memory for result '{}'",
            ptr, byte_size, memory_type, context.tensor_name
        );

        match self.live.lock().remove(&context.id) {
            Some((_, allocated)) if allocated != byte_size => warn!(
                "buffer for '{}' released with size {} but was allocated with {}",
                context.tensor_name, byte_size, allocated
            ),
            Some(_) => {}
            None => warn!("release of untracked buffer for '{}'", context.tensor_name),
        }
        self.stats.lock().releases += 1;

        drop(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_returns_no_buffer() {
        let allocator = CpuAllocator::new();
        for memory_type in [MemoryType::Cpu, MemoryType::Gpu] {
            let allocation = allocator.allocate("OUTPUT0", 0, memory_type, 0).unwrap();
            assert!(allocation.buffer.is_none());
            assert_eq!(allocation.context.as_ref().unwrap().tensor_name, "OUTPUT0");
        }
    }

    #[test]
    fn test_unsupported_memory_type_is_not_an_error() {
        let allocator = CpuAllocator::new();
        let allocation = allocator.allocate("OUTPUT0", 64, MemoryType::Gpu, 0).unwrap();
        assert!(allocation.buffer.is_none());
        assert!(allocation.context.is_none());
        assert!(!allocation.needs_release());
        assert_eq!(allocator.stats().refused, 1);
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn test_allocate_and_release() {
        let allocator = CpuAllocator::new();
        let allocation = allocator.allocate("OUTPUT1", 64, MemoryType::Cpu, 0).unwrap();
        let buffer = allocation.buffer.unwrap();
        assert_eq!(buffer.len(), 64);
        assert_eq!(buffer.memory_type(), MemoryType::Cpu);
        assert_eq!(allocator.live_buffers(), 1);

        allocator
            .release(Some(buffer), allocation.context, 64, MemoryType::Cpu, 0)
            .unwrap();
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(
            allocator.stats(),
            AllocatorStats {
                allocations: 1,
                releases: 1,
                refused: 0
            }
        );
    }

    #[test]
    fn test_release_without_context() {
        let allocator = CpuAllocator::new();
        allocator
            .release(None, None, 0, MemoryType::Cpu, 0)
            .unwrap();
        assert_eq!(allocator.stats().releases, 1);
    }

    #[test]
    fn test_memory_type_parse() {
        assert_eq!("CPU".parse::<MemoryType>().unwrap(), MemoryType::Cpu);
        assert_eq!("gpu".parse::<MemoryType>().unwrap(), MemoryType::Gpu);
        assert!("tpu".parse::<MemoryType>().is_err());
        assert_eq!(MemoryType::CpuPinned.to_string(), "cpu_pinned");
    }
}
