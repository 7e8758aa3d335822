//! Evaluator trait for batched position evaluation.
//!
//! The evaluator provides policy and value estimates for a whole mini-batch
//! of positions in one synchronous call. In self-play this is a neural
//! network; for testing, [`UniformEvaluator`] returns flat priors.

use thiserror::Error;

/// Errors that can occur during evaluation.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("model error: {0}")]
    ModelError(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Synchronous batched policy/value predictor.
///
/// `input_planes` holds `B` positions of `plane_size` floats each, where `B`
/// is `value_out.len()`. The implementation writes one value per position
/// into `value_out` and `B * policy_output_length()` floats into
/// `policy_out`. All buffers are owned by the caller; implementations must
/// not retain references past return.
pub trait Evaluator: Send + Sync {
    fn predict(
        &self,
        input_planes: &[f32],
        value_out: &mut [f32],
        policy_out: &mut [f32],
    ) -> Result<(), EvaluatorError>;

    /// Whether the policy output is already a probability distribution over
    /// the move space (a "policy map"). When false the output is raw logits
    /// and the search applies a softmax over the legal moves.
    fn is_policy_map(&self) -> bool {
        false
    }

    /// Per-position stride of `policy_out`.
    fn policy_output_length(&self) -> usize;
}

/// Evaluator returning a neutral value and flat logits, which the search's
/// softmax turns into a uniform prior over legal moves. For testing the
/// search machinery without a model.
#[derive(Debug, Clone)]
pub struct UniformEvaluator {
    policy_len: usize,
}

impl UniformEvaluator {
    pub fn new(policy_len: usize) -> Self {
        Self { policy_len }
    }
}

impl Evaluator for UniformEvaluator {
    fn predict(
        &self,
        _input_planes: &[f32],
        value_out: &mut [f32],
        policy_out: &mut [f32],
    ) -> Result<(), EvaluatorError> {
        value_out.fill(0.0);
        policy_out.fill(0.0);
        Ok(())
    }

    fn policy_output_length(&self) -> usize {
        self.policy_len
    }
}
