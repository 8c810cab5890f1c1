//! Response envelope and output buffers.

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

use super::tensor::bytes_to_i32;
use crate::error::{InferError, Result};
use crate::memory::{Allocation, Buffer, BufferContext, MemoryType, ResponseAllocator};

/// Metadata for one returned output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub name: String,
    pub byte_size: usize,
    /// Full shape including the batch dimension, if the model batches.
    pub dims: Vec<i64>,
}

/// Metadata describing a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub id: u64,
    pub model_name: String,
    pub model_version: i64,
    pub batch_size: u32,
    pub output: Vec<OutputMeta>,
}

/// A result tensor held in allocator-provided memory.
///
/// The caller owns it once the response is delivered. Dropping it hands
/// the buffer back to the allocator that produced it, exactly once.
pub struct OutputBuffer {
    name: String,
    buffer: Option<Buffer>,
    context: Option<BufferContext>,
    byte_size: usize,
    memory_type: MemoryType,
    memory_type_id: i64,
    dims: Vec<i64>,
    allocator: Arc<dyn ResponseAllocator>,
}

impl OutputBuffer {
    /// Wrap an allocation made with `memory_type` so that it is released
    /// through `allocator` when dropped.
    pub(crate) fn new(
        name: impl Into<String>,
        allocation: Allocation,
        byte_size: usize,
        memory_type: MemoryType,
        memory_type_id: i64,
        dims: Vec<i64>,
        allocator: Arc<dyn ResponseAllocator>,
    ) -> Self {
        Self {
            name: name.into(),
            buffer: allocation.buffer,
            context: allocation.context,
            byte_size,
            memory_type,
            memory_type_id,
            dims,
            allocator,
        }
    }

    /// Copy result bytes into the allocated buffer.
    pub(crate) fn fill(&mut self, data: &[u8]) -> Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) if buffer.len() >= data.len() => {
                buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
                Ok(())
            }
            Some(buffer) => Err(InferError::Allocation {
                tensor: self.name.clone(),
                reason: format!(
                    "buffer holds {} bytes but {} are needed",
                    buffer.len(),
                    data.len()
                ),
            }),
            None if data.is_empty() => Ok(()),
            None => Err(InferError::Allocation {
                tensor: self.name.clone(),
                reason: format!("no buffer for {} bytes", data.len()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Memory type the buffer actually lives in.
    pub fn memory_type(&self) -> MemoryType {
        self.buffer
            .as_ref()
            .map_or(self.memory_type, Buffer::memory_type)
    }

    pub fn memory_type_id(&self) -> i64 {
        self.memory_type_id
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// The result bytes. Empty for zero-sized outputs.
    pub fn content(&self) -> &[u8] {
        self.buffer
            .as_ref()
            .map_or(&[][..], |b| &b.as_slice()[..self.byte_size])
    }

    pub fn expect_byte_size(&self, expected: usize) -> Result<()> {
        if self.byte_size != expected {
            return Err(InferError::data_integrity(
                &self.name,
                "byte size",
                expected,
                self.byte_size,
            ));
        }
        Ok(())
    }

    pub fn expect_memory_type(&self, expected: MemoryType) -> Result<()> {
        let actual = self.memory_type();
        if actual != expected {
            return Err(InferError::data_integrity(
                &self.name,
                "memory type",
                expected,
                actual,
            ));
        }
        Ok(())
    }

    /// Check both byte size and memory type.
    pub fn expect_layout(&self, byte_size: usize, memory_type: MemoryType) -> Result<()> {
        self.expect_byte_size(byte_size)?;
        self.expect_memory_type(memory_type)
    }

    /// Read the content as int32 values. Only valid for host memory.
    pub fn to_i32_vec(&self) -> Result<Vec<i32>> {
        if self.memory_type() == MemoryType::Gpu {
            return Err(InferError::data_integrity(
                &self.name,
                "memory type",
                "host-readable memory",
                MemoryType::Gpu,
            ));
        }
        bytes_to_i32(self.content()).ok_or_else(|| {
            InferError::data_integrity(
                &self.name,
                "byte size",
                "a multiple of 4",
                self.byte_size,
            )
        })
    }

    /// Read the content as an int32 array shaped by [`dims`](Self::dims).
    pub fn to_array_i32(&self) -> Result<ArrayD<i32>> {
        let values = self.to_i32_vec()?;
        let shape = self
            .dims
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| {
                InferError::data_integrity(
                    &self.name,
                    "shape",
                    "non-negative dims",
                    format!("{:?}", self.dims),
                )
            })?;
        ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| {
            InferError::data_integrity(&self.name, "shape", format!("{:?}", shape), e)
        })
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("name", &self.name)
            .field("byte_size", &self.byte_size)
            .field("memory_type", &self.memory_type())
            .field("dims", &self.dims)
            .finish()
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        if self.buffer.is_none() && self.context.is_none() {
            return;
        }
        if let Err(e) = self.allocator.release(
            self.buffer.take(),
            self.context.take(),
            self.byte_size,
            self.memory_type,
            self.memory_type_id,
        ) {
            warn!("failed to release buffer for '{}': {}", self.name, e);
        }
    }
}

/// Counts a live response against the server that produced it.
#[derive(Debug)]
pub(crate) struct ResponseLease(Arc<AtomicUsize>);

impl ResponseLease {
    pub(crate) fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ResponseLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum OutputSlot {
    Ready(OutputBuffer),
    Unavailable,
    Taken,
}

/// The single result of a request.
///
/// Check [`status`](Self::status) before reading outputs; the output
/// accessors refuse to read from a failed response. Outputs can be taken
/// out and released one at a time with [`take_output`](Self::take_output);
/// dropping the response releases every output buffer it still owns.
#[derive(Debug)]
pub struct InferenceResponse {
    id: u64,
    status: std::result::Result<ResponseHeader, String>,
    outputs: Vec<(String, OutputSlot)>,
    _lease: Option<ResponseLease>,
}

impl InferenceResponse {
    /// Successful response. `None` marks an output no buffer could be
    /// allocated for.
    pub(crate) fn success(
        header: ResponseHeader,
        outputs: Vec<(String, Option<OutputBuffer>)>,
    ) -> Self {
        let outputs = outputs
            .into_iter()
            .map(|(name, output)| {
                let slot = output.map_or(OutputSlot::Unavailable, OutputSlot::Ready);
                (name, slot)
            })
            .collect();
        Self {
            id: header.id,
            status: Ok(header),
            outputs,
            _lease: None,
        }
    }

    pub(crate) fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: Err(message.into()),
            outputs: Vec::new(),
            _lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: ResponseLease) -> Self {
        self._lease = Some(lease);
        self
    }

    /// Correlation id copied from the request header.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// `Ok` if the request succeeded, otherwise the failure it carried.
    pub fn status(&self) -> Result<()> {
        self.header().map(|_| ())
    }

    pub fn header(&self) -> Result<&ResponseHeader> {
        self.status
            .as_ref()
            .map_err(|msg| InferError::inference(msg.clone()))
    }

    pub fn serialized_header(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self.header()?)?)
    }

    /// Look up an output by name.
    pub fn output(&self, name: &str) -> Result<&OutputBuffer> {
        match self.slot(name)? {
            OutputSlot::Ready(output) => Ok(output),
            OutputSlot::Unavailable => Err(InferError::OutputUnavailable(name.to_string())),
            OutputSlot::Taken => Err(taken(name)),
        }
    }

    /// Move an output out of the response.
    ///
    /// Dropping the returned buffer releases it at once, independently of
    /// the other outputs. Later lookups of `name` fail with a usage error.
    pub fn take_output(&mut self, name: &str) -> Result<OutputBuffer> {
        let slot = self.slot_mut(name)?;
        match std::mem::replace(slot, OutputSlot::Taken) {
            OutputSlot::Ready(output) => Ok(output),
            OutputSlot::Unavailable => {
                *slot = OutputSlot::Unavailable;
                Err(InferError::OutputUnavailable(name.to_string()))
            }
            OutputSlot::Taken => Err(taken(name)),
        }
    }

    fn slot(&self, name: &str) -> Result<&OutputSlot> {
        self.status()?;
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| slot)
            .ok_or_else(|| InferError::UnknownOutput(name.to_string()))
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut OutputSlot> {
        self.status()?;
        self.outputs
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| slot)
            .ok_or_else(|| InferError::UnknownOutput(name.to_string()))
    }

    /// Output names in request order.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }
}

fn taken(name: &str) -> InferError {
    InferError::usage(format!("output '{}' was already taken", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::tensor::i32_to_bytes;
    use crate::memory::CpuAllocator;

    fn output(allocator: &Arc<CpuAllocator>, name: &str, values: &[i32]) -> OutputBuffer {
        let data = i32_to_bytes(values);
        let allocation = allocator
            .allocate(name, data.len(), MemoryType::Cpu, 0)
            .unwrap();
        let dynamic: Arc<dyn ResponseAllocator> = allocator.clone();
        let mut out = OutputBuffer::new(
            name,
            allocation,
            data.len(),
            MemoryType::Cpu,
            0,
            vec![1, values.len() as i64],
            dynamic,
        );
        out.fill(&data).unwrap();
        out
    }

    fn response(allocator: &Arc<CpuAllocator>) -> InferenceResponse {
        let header = ResponseHeader {
            id: 5,
            model_name: "simple".into(),
            model_version: 1,
            batch_size: 1,
            output: vec![],
        };
        InferenceResponse::success(
            header,
            vec![
                ("A".into(), Some(output(allocator, "A", &[1, 2, 3, 4]))),
                ("B".into(), None),
            ],
        )
    }

    #[test]
    fn test_lookup_by_name() {
        let allocator = Arc::new(CpuAllocator::new());
        let response = response(&allocator);
        let a = response.output("A").unwrap();
        assert_eq!(a.to_i32_vec().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(a.to_array_i32().unwrap().shape(), &[1, 4]);
        assert!(matches!(
            response.output("B"),
            Err(InferError::OutputUnavailable(_))
        ));
        assert!(matches!(
            response.output("C"),
            Err(InferError::UnknownOutput(_))
        ));
    }

    #[test]
    fn test_drop_releases_once() {
        let allocator = Arc::new(CpuAllocator::new());
        let response = response(&allocator);
        assert_eq!(allocator.live_buffers(), 1);
        drop(response);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.stats().releases, 1);
    }

    #[test]
    fn test_take_output_releases_independently() {
        let allocator = Arc::new(CpuAllocator::new());
        let header = ResponseHeader {
            id: 6,
            model_name: "simple".into(),
            model_version: 1,
            batch_size: 1,
            output: vec![],
        };
        let mut response = InferenceResponse::success(
            header,
            vec![
                ("A".into(), Some(output(&allocator, "A", &[1, 2]))),
                ("B".into(), Some(output(&allocator, "B", &[3, 4]))),
                ("C".into(), None),
            ],
        );

        let a = response.take_output("A").unwrap();
        assert_eq!(a.to_i32_vec().unwrap(), vec![1, 2]);
        drop(a);
        assert_eq!(allocator.live_buffers(), 1);

        let err = response.output("A").unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Usage);
        assert!(response.take_output("A").is_err());
        assert!(matches!(
            response.take_output("C"),
            Err(InferError::OutputUnavailable(_))
        ));
        assert!(matches!(
            response.output("C"),
            Err(InferError::OutputUnavailable(_))
        ));
        assert_eq!(response.output("B").unwrap().to_i32_vec().unwrap(), vec![3, 4]);

        drop(response);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.stats().releases, 2);
    }

    #[test]
    fn test_expectations_report_both_values() {
        let allocator = Arc::new(CpuAllocator::new());
        let out = output(&allocator, "A", &[1, 2]);
        out.expect_layout(8, MemoryType::Cpu).unwrap();

        let err = out.expect_byte_size(64).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexpected byte size for 'A': expected 64, got 8"
        );
        let err = out.expect_memory_type(MemoryType::Gpu).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexpected memory type for 'A': expected gpu, got cpu"
        );
    }

    #[test]
    fn test_failed_response_hides_outputs() {
        let response = InferenceResponse::failure(9, "backend exploded");
        assert!(!response.is_ok());
        assert!(matches!(response.status(), Err(InferError::Inference(_))));
        assert!(matches!(
            response.output("A"),
            Err(InferError::Inference(_))
        ));
    }

    #[test]
    fn test_lease_tracks_outstanding() {
        let counter = Arc::new(AtomicUsize::new(0));
        let response =
            InferenceResponse::failure(1, "x").with_lease(ResponseLease::acquire(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(response);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
