//! inferbridge-rs: asynchronous inference against an embedded inference server.
//!
//! The crate implements the client side of the server's asynchronous
//! request protocol, and an in-process server that honors it:
//!
//! - **Response allocation**: output buffers come from a caller-supplied
//!   [`ResponseAllocator`], tagged with a [`MemoryType`], and go back to
//!   it exactly once when the caller drops them.
//! - **Readiness gating**: [`ReadinessPoller`] blocks until the server and
//!   then a model version are ready, giving up after a fixed number of
//!   probes.
//! - **Completion handoff**: [`inference::submit`] returns before the
//!   result is known and delivers a typed context back with the single
//!   [`InferenceResponse`]; [`inference::infer`] wraps that in a future.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use inferbridge_rs::inference::{infer, InferenceRequest, RequestHeader};
//! use inferbridge_rs::server::{EmbeddedServer, ServerOptions};
//! use inferbridge_rs::{CpuAllocator, MemoryType, ReadinessPoller};
//!
//! # fn main() -> inferbridge_rs::Result<()> {
//! let server = EmbeddedServer::new(ServerOptions::new("/models"))?;
//! let poller = ReadinessPoller::default();
//! poller.wait_for_server(&server)?;
//! poller.wait_for_model(&server, "simple", 1)?;
//!
//! let header = RequestHeader::new(123)
//!     .input("INPUT0")
//!     .input("INPUT1")
//!     .output("OUTPUT0")
//!     .output("OUTPUT1");
//! let mut request = InferenceRequest::new("simple", -1, &header.serialize()?)?;
//! request.set_input_i32("INPUT0", &(0..16).collect::<Vec<i32>>())?;
//! request.set_input_i32("INPUT1", &[1; 16])?;
//!
//! let response = infer(&server, request, Arc::new(CpuAllocator::new()))?.wait()?;
//! response.status()?;
//! let sum = response.output("OUTPUT0")?;
//! sum.expect_layout(64, MemoryType::Cpu)?;
//! println!("{:?}", sum.to_i32_vec()?);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod inference;
pub mod memory;
pub mod server;
pub mod status;

// Re-export commonly used types
pub use error::{ErrorCategory, InferError, Result};
pub use health::{Health, ReadinessPoller};
pub use inference::{InferenceRequest, InferenceResponse, OutputBuffer, RequestHeader};
pub use memory::{CpuAllocator, MemoryType, ResponseAllocator};
pub use server::{EmbeddedServer, InferenceServer, ServerOptions};
