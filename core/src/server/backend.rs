//! Built-in execution backends.

use bytes::Bytes;
use ndarray::{Array1, Zip};
use std::collections::HashMap;
use std::sync::Arc;

use super::repository::ModelConfig;
use crate::error::{InferError, Result};
use crate::inference::{bytes_to_i32, i32_to_bytes, DataType};

/// Computes a model's outputs from its inputs.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reject configs this backend cannot run.
    fn validate(&self, config: &ModelConfig) -> Result<()>;

    /// Produce every configured output from the bound inputs.
    fn execute(
        &self,
        config: &ModelConfig,
        batch_size: u32,
        inputs: &HashMap<String, Bytes>,
    ) -> Result<HashMap<String, Vec<u8>>>;
}

/// Look up a built-in backend by name.
pub fn backend_for(name: &str) -> Option<Arc<dyn Backend>> {
    match name {
        "add_sub" => Some(Arc::new(AddSubBackend)),
        "identity" => Some(Arc::new(IdentityBackend)),
        _ => None,
    }
}

fn input<'a>(inputs: &'a HashMap<String, Bytes>, name: &str) -> Result<&'a Bytes> {
    inputs
        .get(name)
        .ok_or_else(|| InferError::inference(format!("missing input '{}'", name)))
}

/// Elementwise INT32 sum and difference of two inputs.
///
/// The first output receives `INPUT0 + INPUT1`, the second `INPUT0 - INPUT1`.
/// An element that overflows INT32 fails the request.
#[derive(Debug, Default)]
pub struct AddSubBackend;

impl Backend for AddSubBackend {
    fn name(&self) -> &'static str {
        "add_sub"
    }

    fn validate(&self, config: &ModelConfig) -> Result<()> {
        if config.input.len() != 2 || config.output.len() != 2 {
            return Err(InferError::config(format!(
                "add_sub needs 2 inputs and 2 outputs, model '{}' has {} and {}",
                config.name,
                config.input.len(),
                config.output.len()
            )));
        }
        let dims = &config.input[0].dims;
        for spec in config.input.iter().chain(&config.output) {
            if spec.data_type != DataType::Int32 {
                return Err(InferError::config(format!(
                    "add_sub only supports INT32, '{}' is {}",
                    spec.name, spec.data_type
                )));
            }
            if &spec.dims != dims {
                return Err(InferError::config(format!(
                    "add_sub needs equal dims, '{}' has {:?}",
                    spec.name, spec.dims
                )));
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        config: &ModelConfig,
        _batch_size: u32,
        inputs: &HashMap<String, Bytes>,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let decode = |name: &str| -> Result<Array1<i32>> {
            bytes_to_i32(input(inputs, name)?)
                .map(Array1::from)
                .ok_or_else(|| InferError::inference(format!("input '{}' is not INT32", name)))
        };
        let a = decode(&config.input[0].name)?;
        let b = decode(&config.input[1].name)?;
        if a.len() != b.len() {
            return Err(InferError::inference(format!(
                "input lengths differ: {} vs {}",
                a.len(),
                b.len()
            )));
        }

        let sum = elementwise(&a, &b, i32::checked_add, &config.output[0].name)?;
        let diff = elementwise(&a, &b, i32::checked_sub, &config.output[1].name)?;

        let mut outputs = HashMap::new();
        outputs.insert(config.output[0].name.clone(), i32_to_bytes(&sum));
        outputs.insert(config.output[1].name.clone(), i32_to_bytes(&diff));
        Ok(outputs)
    }
}

fn elementwise(
    a: &Array1<i32>,
    b: &Array1<i32>,
    op: fn(i32, i32) -> Option<i32>,
    output: &str,
) -> Result<Vec<i32>> {
    Zip::from(a)
        .and(b)
        .map_collect(|x, y| op(*x, *y))
        .iter()
        .copied()
        .collect::<Option<Vec<i32>>>()
        .ok_or_else(|| InferError::inference(format!("INT32 overflow computing '{}'", output)))
}

/// Copies input `i` to output `i`, for any data type.
#[derive(Debug, Default)]
pub struct IdentityBackend;

impl Backend for IdentityBackend {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn validate(&self, config: &ModelConfig) -> Result<()> {
        if config.input.len() != config.output.len() {
            return Err(InferError::config(format!(
                "identity needs as many outputs as inputs, model '{}' has {} and {}",
                config.name,
                config.input.len(),
                config.output.len()
            )));
        }
        for (i, o) in config.input.iter().zip(&config.output) {
            if i.data_type != o.data_type || i.dims != o.dims {
                return Err(InferError::config(format!(
                    "identity output '{}' does not match input '{}'",
                    o.name, i.name
                )));
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        config: &ModelConfig,
        _batch_size: u32,
        inputs: &HashMap<String, Bytes>,
    ) -> Result<HashMap<String, Vec<u8>>> {
        config
            .input
            .iter()
            .zip(&config.output)
            .map(|(i, o)| Ok((o.name.clone(), input(inputs, &i.name)?.to_vec())))
            .collect()
    }
}
