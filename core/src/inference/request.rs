//! Request envelope: the header naming inputs and outputs, and the
//! request that binds input data to it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::tensor::i32_to_bytes;
use crate::error::{InferError, Result};
use crate::memory::MemoryType;

/// Named input declared in a request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub name: String,
    /// Shape without the batch dimension. Empty means "as configured".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dims: Vec<i64>,
}

/// Named output requested in a request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub name: String,
}

/// Describes what a request supplies and what it wants back.
///
/// Inputs and outputs are appended in caller order; order only affects
/// iteration, never correctness.
///
/// # Example
///
/// ```
/// use inferbridge_rs::inference::RequestHeader;
///
/// let header = RequestHeader::new(123)
///     .input("INPUT0")
///     .input("INPUT1")
///     .output("OUTPUT0")
///     .output("OUTPUT1");
/// assert_eq!(header.batch_size, 1);
/// let bytes = header.serialize().unwrap();
/// assert_eq!(RequestHeader::deserialize(&bytes).unwrap(), header);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Caller-assigned correlation id.
    pub id: u64,
    pub batch_size: u32,
    #[serde(default)]
    pub input: Vec<InputDescriptor>,
    #[serde(default)]
    pub output: Vec<OutputDescriptor>,
}

impl RequestHeader {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            batch_size: 1,
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.input.push(InputDescriptor {
            name: name.into(),
            dims: Vec::new(),
        });
        self
    }

    pub fn input_with_dims(mut self, name: impl Into<String>, dims: Vec<i64>) -> Self {
        self.input.push(InputDescriptor {
            name: name.into(),
            dims,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.output.push(OutputDescriptor { name: name.into() });
        self
    }

    pub fn declares_input(&self, name: &str) -> bool {
        self.input.iter().any(|i| i.name == name)
    }

    pub fn declares_output(&self, name: &str) -> bool {
        self.output.iter().any(|o| o.name == name)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| InferError::usage(format!("malformed request header: {}", e)))
    }
}

/// Data attached to a declared input.
#[derive(Debug, Clone)]
pub struct InputBinding {
    pub name: String,
    pub data: Bytes,
    /// Where `data` lives; the embedded server only reads host memory.
    pub memory_type: MemoryType,
}

impl InputBinding {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// A request ready for submission.
///
/// The header is frozen at construction. Submission takes the request by
/// value, so the caller cannot touch its bindings afterwards.
#[derive(Debug)]
pub struct InferenceRequest {
    model_name: String,
    model_version: i64,
    header: RequestHeader,
    inputs: HashMap<String, InputBinding>,
}

impl InferenceRequest {
    /// Build a request from a serialized [`RequestHeader`].
    ///
    /// `model_version` of `-1` selects the latest ready version.
    pub fn new(
        model_name: impl Into<String>,
        model_version: i64,
        serialized_header: &[u8],
    ) -> Result<Self> {
        let header = RequestHeader::deserialize(serialized_header)?;
        Ok(Self::from_header(model_name, model_version, header))
    }

    pub fn from_header(
        model_name: impl Into<String>,
        model_version: i64,
        header: RequestHeader,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_version,
            header,
            inputs: HashMap::new(),
        }
    }

    /// Attach data to a declared input.
    pub fn set_input_data(
        &mut self,
        name: &str,
        data: impl Into<Bytes>,
        memory_type: MemoryType,
    ) -> Result<()> {
        if !self.header.declares_input(name) {
            return Err(InferError::usage(format!(
                "input '{}' is not declared in the request header",
                name
            )));
        }
        if self.inputs.contains_key(name) {
            return Err(InferError::usage(format!(
                "input '{}' already has data attached",
                name
            )));
        }
        self.inputs.insert(
            name.to_string(),
            InputBinding {
                name: name.to_string(),
                data: data.into(),
                memory_type,
            },
        );
        Ok(())
    }

    /// Attach int32 host data to a declared input.
    pub fn set_input_i32(&mut self, name: &str, values: &[i32]) -> Result<()> {
        self.set_input_data(name, i32_to_bytes(values), MemoryType::Cpu)
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> i64 {
        self.model_version
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn input(&self, name: &str) -> Option<&InputBinding> {
        self.inputs.get(name)
    }

    /// Declared inputs that still have no data attached.
    pub fn missing_inputs(&self) -> Vec<&str> {
        self.header
            .input
            .iter()
            .filter(|i| !self.inputs.contains_key(&i.name))
            .map(|i| i.name.as_str())
            .collect()
    }
}
