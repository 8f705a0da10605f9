//! Unfused reference attention.
//!
//! Scores, bias, softmax and the weighted sum run as separate tensor ops in
//! `f32`. This is the only kernel that supports every mask encoding and can
//! return raw attention scores.

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult};
use candle_nn::ops::softmax_last_dim;

use crate::core::{
    AttentionError, AttentionKernel, AttentionProblem, KernelOutput, ProblemDims, QkOutputMode,
};
use crate::selector::KernelCandidate;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct UnfusedAttention {
    first_call: OnceLock<()>,
}

impl UnfusedAttention {
    pub fn new() -> Self {
        Self::default()
    }

    fn compute(&self, problem: &AttentionProblem, dims: ProblemDims) -> CandleResult<KernelOutput> {
        let ProblemDims {
            batch,
            heads,
            seq,
            total,
            head,
            v_head,
        } = dims;
        let dtype = problem.query.dtype();
        let merged = batch * heads;

        let q = problem
            .query
            .to_dtype(DType::F32)?
            .reshape((merged, seq, head))?;
        let k = problem
            .key
            .to_dtype(DType::F32)?
            .reshape((merged, total, head))?;
        let v = problem
            .value
            .to_dtype(DType::F32)?
            .reshape((merged, total, v_head))?;

        let scores = q
            .matmul(&k.t()?)?
            .affine(problem.scale as f64, 0.0)?
            .reshape((batch, heads, seq, total))?;
        let scores = match &problem.bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };

        let probs = softmax_last_dim(&scores.contiguous()?)?;
        let context = probs
            .reshape((merged, seq, total))?
            .matmul(&v)?
            .reshape((batch, heads, seq, v_head))?
            .to_dtype(dtype)?;

        let attention_scores = match problem.output_qk {
            Some(QkOutputMode::BeforeSoftmax) => Some(scores.to_dtype(dtype)?),
            Some(QkOutputMode::AfterSoftmax) => Some(probs.to_dtype(dtype)?),
            None => None,
        };
        Ok(KernelOutput {
            context,
            attention_scores,
        })
    }
}

impl AttentionKernel for UnfusedAttention {
    fn candidate(&self) -> KernelCandidate {
        KernelCandidate::Unfused
    }

    fn attend(&self, problem: &AttentionProblem) -> Result<KernelOutput, AttentionError> {
        let dims = problem.dims()?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::unfused init dtype={:?} device={:?}",
                problem.query.dtype(),
                problem.query.device().location()
            );
        }

        let device = problem.query.device();
        if !device.same_device(problem.key.device()) || !device.same_device(problem.value.device())
        {
            return Err(AttentionError::shape(
                "query, key and value must reside on the same device",
            ));
        }

        self.compute(problem, dims)
            .map_err(|err| AttentionError::BackendExecutionFailure {
                kernel: KernelCandidate::Unfused,
                message: err.to_string(),
            })
    }
}
