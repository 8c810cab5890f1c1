mod common;

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;

use common::{ready_server, repository, RecordingAllocator, EMPTY, SIMPLE, SIMPLE_ON_GPU};
use inferbridge_rs::inference::{infer, InferenceRequest, RequestHeader};
use inferbridge_rs::{ErrorCategory, InferError, MemoryType, ResponseAllocator};

fn add_sub_request(model: &str) -> Result<InferenceRequest> {
    let header = RequestHeader::new(1)
        .input("INPUT0")
        .input("INPUT1")
        .output("OUTPUT0")
        .output("OUTPUT1");
    let mut request = InferenceRequest::from_header(model, 1, header);
    request.set_input_i32("INPUT0", &[3; 16])?;
    request.set_input_i32("INPUT1", &[2; 16])?;
    Ok(request)
}

#[test]
fn every_allocation_is_released_once_with_matching_size_and_type() -> Result<()> {
    let repo = repository(&[("simple", SIMPLE)])?;
    let server = ready_server(&repo, &["simple"])?;
    let recorder = Arc::new(RecordingAllocator::new(&[MemoryType::Cpu]));
    let allocator: Arc<dyn ResponseAllocator> = recorder.clone();

    let mut response = infer(&server, add_sub_request("simple")?, allocator)?.wait()?;
    response.status()?;
    assert_eq!(recorder.allocations.lock().len(), 2);
    assert!(recorder.releases.lock().is_empty());

    // Releasing after completion, one output at a time, is allowed.
    let first = response.take_output("OUTPUT0")?;
    assert_eq!(first.to_i32_vec()?, vec![5; 16]);
    drop(first);
    assert_eq!(recorder.releases.lock().len(), 1);
    assert_eq!(recorder.releases.lock()[0].tensor, "OUTPUT0");

    assert_eq!(response.output("OUTPUT1")?.to_i32_vec()?, vec![1; 16]);
    drop(response);

    assert_eq!(recorder.releases.lock().len(), 2);
    recorder.assert_paired()
}

#[test]
fn allocator_errors_only_cost_the_failing_output() -> Result<()> {
    let repo = repository(&[("simple", SIMPLE)])?;
    let server = ready_server(&repo, &["simple"])?;
    let recorder = Arc::new(RecordingAllocator::failing_on("OUTPUT1"));

    let response = infer(&server, add_sub_request("simple")?, recorder.clone())?.wait()?;
    response.status()?;

    let sum = response.output("OUTPUT0")?;
    sum.expect_layout(64, MemoryType::Cpu)?;
    assert_eq!(sum.to_i32_vec()?, vec![5; 16]);

    let err = response.output("OUTPUT1").unwrap_err();
    assert!(matches!(err, InferError::OutputUnavailable(ref name) if name == "OUTPUT1"));
    assert_eq!(err.category(), ErrorCategory::Allocation);

    drop(response);
    recorder.assert_paired()
}

#[test]
fn preferred_device_memory_falls_back_to_host() -> Result<()> {
    let repo = repository(&[("simple_gpu", SIMPLE_ON_GPU)])?;
    let server = ready_server(&repo, &["simple_gpu"])?;
    let recorder = Arc::new(RecordingAllocator::new(&[MemoryType::Cpu]));

    let response = infer(&server, add_sub_request("simple_gpu")?, recorder.clone())?.wait()?;
    response.status()?;

    let types: Vec<_> = recorder
        .allocations
        .lock()
        .iter()
        .filter(|c| c.tensor == "OUTPUT0")
        .map(|c| c.memory_type)
        .collect();
    assert_eq!(types, vec![MemoryType::Gpu, MemoryType::Cpu]);

    let output = response.output("OUTPUT0")?;
    output.expect_layout(64, MemoryType::Cpu)?;
    assert_eq!(output.to_i32_vec()?, vec![5; 16]);

    drop(response);
    recorder.assert_paired()
}

#[test]
fn device_buffers_are_kept_when_the_allocator_serves_them() -> Result<()> {
    let repo = repository(&[("simple_gpu", SIMPLE_ON_GPU)])?;
    let server = ready_server(&repo, &["simple_gpu"])?;
    let recorder = Arc::new(RecordingAllocator::new(&[MemoryType::Gpu]));

    let response = infer(&server, add_sub_request("simple_gpu")?, recorder.clone())?.wait()?;
    let output = response.output("OUTPUT1")?;

    let err = output.expect_layout(64, MemoryType::Cpu).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DataIntegrity);
    assert!(output.to_i32_vec().is_err());

    drop(response);
    recorder.assert_paired()?;
    assert!(recorder
        .releases
        .lock()
        .iter()
        .all(|c| c.memory_type == MemoryType::Gpu));
    Ok(())
}

#[test]
fn unsupported_memory_marks_outputs_unavailable_without_failing() -> Result<()> {
    let repo = repository(&[("simple", SIMPLE)])?;
    let server = ready_server(&repo, &["simple"])?;
    let recorder = Arc::new(RecordingAllocator::new(&[]));

    let response = infer(&server, add_sub_request("simple")?, recorder.clone())?.wait()?;
    response.status()?;

    let err = response.output("OUTPUT0").unwrap_err();
    assert!(matches!(err, InferError::OutputUnavailable(_)));
    assert_eq!(err.category(), ErrorCategory::Allocation);

    drop(response);
    assert!(recorder.releases.lock().is_empty());
    Ok(())
}

#[test]
fn zero_sized_outputs_get_no_buffer_and_no_error() -> Result<()> {
    let repo = repository(&[("empty", EMPTY)])?;
    let server = ready_server(&repo, &["empty"])?;
    let recorder = Arc::new(RecordingAllocator::new(&[MemoryType::Cpu]));

    let header = RequestHeader::new(4).input("IN").output("OUT");
    let mut request = InferenceRequest::from_header("empty", 1, header);
    request.set_input_data("IN", Bytes::new(), MemoryType::Cpu)?;

    let response = infer(&server, request, recorder.clone())?.wait()?;
    response.status()?;

    let output = response.output("OUT")?;
    assert_eq!(output.byte_size(), 0);
    assert!(output.content().is_empty());

    let allocations = recorder.allocations.lock().clone();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].byte_size, 0);
    assert!(!allocations[0].had_buffer);

    drop(response);
    recorder.assert_paired()
}
