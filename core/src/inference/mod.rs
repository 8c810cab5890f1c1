//! Inference request/response envelope and completion handoff.
//!
//! A request is described by a [`RequestHeader`], bound to data through an
//! [`InferenceRequest`], submitted with [`submit`] or [`infer`], and answered
//! by exactly one [`InferenceResponse`].

mod completion;
mod request;
mod response;
mod tensor;

pub use completion::{infer, submit, CompletionFn, ResponseFuture};
pub use request::{InferenceRequest, InputBinding, InputDescriptor, OutputDescriptor, RequestHeader};
pub use response::{InferenceResponse, OutputBuffer, OutputMeta, ResponseHeader};
pub(crate) use response::ResponseLease;
pub use tensor::{bytes_to_i32, i32_to_bytes, DataType};
