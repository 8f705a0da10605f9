//! Tiled attention with an online softmax.
//!
//! Keys and values are streamed in blocks of `block_size` positions. Each
//! block updates a running row maximum `m`, a rescaled denominator `l` and an
//! accumulator `acc`, so the full `[seq, total]` probability matrix is never
//! materialized:
//!
//! ```text
//! m' = max(m, rowmax(S_j))
//! l' = l * exp(m - m') + rowsum(exp(S_j - m'))
//! acc' = acc * exp(m - m') + exp(S_j - m') V_j
//! ```

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult, Tensor, D};

use crate::core::{AttentionError, AttentionKernel, AttentionProblem, KernelOutput, ProblemDims};
use crate::selector::KernelCandidate;

/// Key/value positions processed per block by default.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

#[derive(Debug)]
pub struct MemoryEfficientAttention {
    block_size: usize,
    first_call: OnceLock<()>,
}

impl Default for MemoryEfficientAttention {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            first_call: OnceLock::new(),
        }
    }
}

impl MemoryEfficientAttention {
    pub fn with_block_size(block_size: usize) -> Result<Self, AttentionError> {
        if block_size == 0 {
            return Err(AttentionError::InvalidConfig(
                "block_size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            first_call: OnceLock::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn compute(&self, problem: &AttentionProblem, dims: ProblemDims) -> CandleResult<Tensor> {
        let ProblemDims {
            batch,
            heads,
            seq,
            total,
            v_head,
            ..
        } = dims;
        let dtype = problem.query.dtype();
        let device = problem.query.device();

        let q = problem
            .query
            .to_dtype(DType::F32)?
            .affine(problem.scale as f64, 0.0)?;
        let k = problem.key.to_dtype(DType::F32)?;
        let v = problem.value.to_dtype(DType::F32)?;

        let mut row_max = Tensor::full(f32::MIN, (batch, heads, seq, 1), device)?;
        let mut row_sum = Tensor::zeros((batch, heads, seq, 1), DType::F32, device)?;
        let mut acc = Tensor::zeros((batch, heads, seq, v_head), DType::F32, device)?;

        let mut start = 0;
        while start < total {
            let len = self.block_size.min(total - start);
            let k_block = k.narrow(2, start, len)?.contiguous()?;
            let v_block = v.narrow(2, start, len)?.contiguous()?;

            let mut scores = q.matmul(&k_block.t()?)?;
            if let Some(bias) = &problem.bias {
                scores = scores.broadcast_add(&bias.narrow(3, start, len)?)?;
            }

            let new_max = row_max.maximum(&scores.max_keepdim(D::Minus1)?)?;
            let weights = scores.broadcast_sub(&new_max)?.exp()?;
            let correction = (&row_max - &new_max)?.exp()?;

            row_sum = ((&row_sum * &correction)? + weights.sum_keepdim(D::Minus1)?)?;
            acc = (acc.broadcast_mul(&correction)? + weights.matmul(&v_block)?)?;
            row_max = new_max;
            start += len;
        }

        acc.broadcast_div(&row_sum)?.to_dtype(dtype)
    }
}

impl AttentionKernel for MemoryEfficientAttention {
    fn candidate(&self) -> KernelCandidate {
        KernelCandidate::MemoryEfficient
    }

    fn attend(&self, problem: &AttentionProblem) -> Result<KernelOutput, AttentionError> {
        let dims = problem.dims()?;
        if problem.output_qk.is_some() {
            return Err(AttentionError::unsupported(
                "memory-efficient attention cannot emit attention scores",
            ));
        }
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::memory_efficient init block_size={} dtype={:?}",
                self.block_size,
                problem.query.dtype()
            );
        }

        let context = self
            .compute(problem, dims)
            .map_err(|err| AttentionError::BackendExecutionFailure {
                kernel: KernelCandidate::MemoryEfficient,
                message: err.to_string(),
            })?;
        Ok(KernelOutput {
            context,
            attention_scores: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QkOutputMode;
    use crate::masks::causal_bias;
    use crate::reference::UnfusedAttention;
    use candle_core::Device;

    fn seeded(shape: (usize, usize, usize, usize), seed: u32) -> CandleResult<Tensor> {
        let count = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..count)
            .map(|i| ((i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed) % 1000) as f32 / 500.0 - 1.0)
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu)
    }

    fn problem(total: usize, v_head: usize, bias: Option<Tensor>) -> CandleResult<AttentionProblem> {
        Ok(AttentionProblem {
            query: seeded((2, 2, 5, 8), 1)?,
            key: seeded((2, 2, total, 8), 2)?,
            value: seeded((2, 2, total, v_head), 3)?,
            bias,
            scale: 1.0 / 8f32.sqrt(),
            output_qk: None,
        })
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()
    }

    #[test]
    fn tiled_matches_reference_across_block_sizes() -> CandleResult<()> {
        let causal = causal_bias(&Device::Cpu, 5, 11, -10_000.0)?;
        for bias in [None, Some(causal)] {
            let masked = bias.is_some();
            let problem = problem(11, 16, bias)?;
            let reference = UnfusedAttention::new().attend(&problem).unwrap().context;
            for block_size in [1, 3, 4, 11, 64] {
                let kernel = MemoryEfficientAttention::with_block_size(block_size).unwrap();
                let context = kernel.attend(&problem).unwrap().context;
                let diff = max_abs_diff(&context, &reference)?;
                assert!(diff < 1e-4, "block {block_size} masked={masked} diverged by {diff}");
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_block_size() {
        assert!(matches!(
            MemoryEfficientAttention::with_block_size(0),
            Err(AttentionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cannot_emit_scores() -> CandleResult<()> {
        let mut problem = problem(4, 8, None)?;
        problem.output_qk = Some(QkOutputMode::AfterSoftmax);
        let err = MemoryEfficientAttention::default().attend(&problem).unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedConfiguration { .. }));
        Ok(())
    }
}
