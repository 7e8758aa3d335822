//! ONNX Runtime evaluator for neural network inference.
//!
//! # Model Format
//!
//! The ONNX model is expected to have:
//! - Input: "planes" - shape (batch_size, channels, height, width) float32
//! - Output: "policy" - shape (batch_size, policy_len) float32
//! - Output: "value" - shape (batch_size, 1) float32
//!
//! The policy output is interpreted as raw logits unless the evaluator is
//! constructed with `policy_map = true`, in which case the model already
//! emits probabilities over the move space.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use ort::{session::Session, value::Value};
use tracing::debug;

use crate::evaluator::{Evaluator, EvaluatorError};

/// Input plane geometry of a model.
#[derive(Debug, Clone, Copy)]
pub struct PlaneDims {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl PlaneDims {
    fn size(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// ONNX Runtime evaluator.
///
/// Uses a Mutex internally because `Session::run` requires `&mut self`,
/// but the `Evaluator` trait uses `&self` for thread-safe sharing.
pub struct OnnxEvaluator {
    session: Mutex<Session>,
    dims: PlaneDims,
    policy_len: usize,
    policy_map: bool,
    /// Number of positions evaluated (for diagnostics)
    inference_count: AtomicU64,
    /// Total inference time in microseconds (for diagnostics)
    total_inference_time_us: AtomicU64,
}

impl std::fmt::Debug for OnnxEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEvaluator")
            .field("dims", &self.dims)
            .field("policy_len", &self.policy_len)
            .field("policy_map", &self.policy_map)
            .finish_non_exhaustive()
    }
}

impl OnnxEvaluator {
    /// Load an ONNX model from the given path.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        dims: PlaneDims,
        policy_len: usize,
        policy_map: bool,
    ) -> Result<Self, EvaluatorError> {
        let session = Session::builder()
            .map_err(|e| {
                EvaluatorError::ModelError(format!("Failed to create session builder: {}", e))
            })?
            .with_intra_threads(1)
            .map_err(|e| EvaluatorError::ModelError(format!("Failed to set intra threads: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| EvaluatorError::ModelError(format!("Failed to load model: {}", e)))?;

        Ok(Self {
            session: Mutex::new(session),
            dims,
            policy_len,
            policy_map,
            inference_count: AtomicU64::new(0),
            total_inference_time_us: AtomicU64::new(0),
        })
    }

    /// Load an ONNX model from memory.
    pub fn load_from_memory(
        model_data: &[u8],
        dims: PlaneDims,
        policy_len: usize,
        policy_map: bool,
    ) -> Result<Self, EvaluatorError> {
        let session = Session::builder()
            .map_err(|e| {
                EvaluatorError::ModelError(format!("Failed to create session builder: {}", e))
            })?
            .with_intra_threads(1)
            .map_err(|e| EvaluatorError::ModelError(format!("Failed to set intra threads: {}", e)))?
            .commit_from_memory(model_data)
            .map_err(|e| {
                EvaluatorError::ModelError(format!("Failed to load model from memory: {}", e))
            })?;

        Ok(Self {
            session: Mutex::new(session),
            dims,
            policy_len,
            policy_map,
            inference_count: AtomicU64::new(0),
            total_inference_time_us: AtomicU64::new(0),
        })
    }
}

impl Evaluator for OnnxEvaluator {
    fn predict(
        &self,
        input_planes: &[f32],
        value_out: &mut [f32],
        policy_out: &mut [f32],
    ) -> Result<(), EvaluatorError> {
        let batch = value_out.len();
        if input_planes.len() != batch * self.dims.size() {
            return Err(EvaluatorError::InvalidInput(format!(
                "expected {} input floats for batch {}, got {}",
                batch * self.dims.size(),
                batch,
                input_planes.len()
            )));
        }
        if policy_out.len() != batch * self.policy_len {
            return Err(EvaluatorError::InvalidInput(format!(
                "expected {} policy floats for batch {}, got {}",
                batch * self.policy_len,
                batch,
                policy_out.len()
            )));
        }

        let input_array = ndarray::Array4::from_shape_vec(
            (batch, self.dims.channels, self.dims.height, self.dims.width),
            input_planes.to_vec(),
        )
        .map_err(|e| EvaluatorError::InvalidInput(format!("Failed to create input array: {}", e)))?;

        let input_value = Value::from_array(input_array).map_err(|e| {
            EvaluatorError::ModelError(format!("Failed to create input tensor: {}", e))
        })?;

        // Run inference - extract all data inside the lock scope
        let inference_start = Instant::now();
        {
            let mut session = self
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let outputs = session
                .run(ort::inputs!["planes" => input_value])
                .map_err(|e| EvaluatorError::InferenceFailed(format!("Inference failed: {}", e)))?;

            let policy_output = outputs
                .get("policy")
                .ok_or_else(|| EvaluatorError::ModelError("Missing policy output".to_string()))?;
            let (_shape, policy_data) = policy_output.try_extract_tensor::<f32>().map_err(|e| {
                EvaluatorError::ModelError(format!("Failed to extract policy tensor: {}", e))
            })?;
            policy_out.copy_from_slice(&policy_data[..policy_out.len()]);

            let value_output = outputs
                .get("value")
                .ok_or_else(|| EvaluatorError::ModelError("Missing value output".to_string()))?;
            let (_shape, value_data) = value_output.try_extract_tensor::<f32>().map_err(|e| {
                EvaluatorError::ModelError(format!("Failed to extract value tensor: {}", e))
            })?;
            value_out.copy_from_slice(&value_data[..batch]);
        }

        // Track per-position inference timing for diagnostics
        let inference_time_us = inference_start.elapsed().as_micros() as u64;
        self.total_inference_time_us
            .fetch_add(inference_time_us, Ordering::Relaxed);
        let count = self
            .inference_count
            .fetch_add(batch as u64, Ordering::Relaxed)
            + batch as u64;

        if count % 10_000 < batch as u64 {
            let total_us = self.total_inference_time_us.load(Ordering::Relaxed);
            debug!(
                positions = count,
                avg_batch_ms = total_us as f64 / 1000.0 / count.max(1) as f64,
                "ONNX inference stats"
            );
        }

        Ok(())
    }

    fn is_policy_map(&self) -> bool {
        self.policy_map
    }

    fn policy_output_length(&self) -> usize {
        self.policy_len
    }
}

/// A thread-safe wrapper around OnnxEvaluator.
/// This can be cloned into every search worker.
pub struct SharedOnnxEvaluator {
    inner: Arc<OnnxEvaluator>,
}

impl SharedOnnxEvaluator {
    pub fn new(evaluator: OnnxEvaluator) -> Self {
        Self {
            inner: Arc::new(evaluator),
        }
    }

    /// Load a shared ONNX model from the given path.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        dims: PlaneDims,
        policy_len: usize,
        policy_map: bool,
    ) -> Result<Self, EvaluatorError> {
        let evaluator = OnnxEvaluator::load(model_path, dims, policy_len, policy_map)?;
        Ok(Self::new(evaluator))
    }
}

impl Clone for SharedOnnxEvaluator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Evaluator for SharedOnnxEvaluator {
    fn predict(
        &self,
        input_planes: &[f32],
        value_out: &mut [f32],
        policy_out: &mut [f32],
    ) -> Result<(), EvaluatorError> {
        self.inner.predict(input_planes, value_out, policy_out)
    }

    fn is_policy_map(&self) -> bool {
        self.inner.is_policy_map()
    }

    fn policy_output_length(&self) -> usize {
        self.inner.policy_output_length()
    }
}
