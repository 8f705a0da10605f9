//! Compute backend interface.
//!
//! Every kernel consumes the same head-major problem and must agree with the
//! unfused reference within [`Precision::tolerance`](crate::layout::Precision::tolerance).

use std::fmt::Debug;

use candle_core::{DType, Device, DeviceLocation, Tensor};

use crate::core::{AttentionError, QkOutputMode};
use crate::selector::{KernelCandidate, SelectionContext};

/// Physical device class a request runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    pub fn from_device(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Self::Cpu,
            DeviceLocation::Cuda { gpu_id } => Self::Cuda(gpu_id),
            DeviceLocation::Metal { gpu_id } => Self::Metal(gpu_id),
        }
    }

    pub fn is_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

/// One fully normalized attention computation.
///
/// * `query`: `[batch, heads, seq, head]`
/// * `key`: `[batch, heads, total, head]`
/// * `value`: `[batch, heads, total, v_head]`
/// * `bias`: additive `f32` `[batch|1, heads|1, seq, total]`, already holding
///   every mask and attention-bias contribution.
#[derive(Debug, Clone)]
pub struct AttentionProblem {
    pub query: Tensor,
    pub key: Tensor,
    pub value: Tensor,
    pub bias: Option<Tensor>,
    pub scale: f32,
    /// Which scores to return alongside the context, if any.
    pub output_qk: Option<QkOutputMode>,
}

/// Dimensions of an [`AttentionProblem`] after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemDims {
    pub batch: usize,
    pub heads: usize,
    pub seq: usize,
    pub total: usize,
    pub head: usize,
    pub v_head: usize,
}

impl AttentionProblem {
    /// Check that query, key, value and bias agree and return their dimensions.
    pub fn dims(&self) -> Result<ProblemDims, AttentionError> {
        let (batch, heads, seq, head) = self.query.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "query must be [batch, heads, seq, head], got {:?}",
                self.query.dims()
            ))
        })?;
        let (kb, kh, total, kd) = self.key.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "key must be [batch, heads, total, head], got {:?}",
                self.key.dims()
            ))
        })?;
        let (vb, vh, vt, v_head) = self.value.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "value must be [batch, heads, total, v_head], got {:?}",
                self.value.dims()
            ))
        })?;
        if kb != batch || kh != heads || kd != head {
            return Err(AttentionError::shape(format!(
                "key shape mismatch: expected [{batch}, {heads}, ?, {head}] got [{kb}, {kh}, {total}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vt != total {
            return Err(AttentionError::shape(format!(
                "value shape mismatch: expected [{batch}, {heads}, {total}, ?] got [{vb}, {vh}, {vt}, {v_head}]"
            )));
        }
        let dtype = self.query.dtype();
        if self.key.dtype() != dtype || self.value.dtype() != dtype {
            return Err(AttentionError::shape(
                "query, key and value must share the same dtype",
            ));
        }
        if let Some(bias) = &self.bias {
            let (bb, bh, bq, bk) = bias.dims4().map_err(|_| {
                AttentionError::shape(format!(
                    "bias must be [batch|1, heads|1, seq, total], got {:?}",
                    bias.dims()
                ))
            })?;
            if (bb != 1 && bb != batch) || (bh != 1 && bh != heads) || bq != seq || bk != total {
                return Err(AttentionError::shape(format!(
                    "bias shape mismatch: expected [1|{batch}, 1|{heads}, {seq}, {total}] got [{bb}, {bh}, {bq}, {bk}]"
                )));
            }
            if bias.dtype() != DType::F32 {
                return Err(AttentionError::shape(format!(
                    "bias must be f32, got {:?}",
                    bias.dtype()
                )));
            }
        }
        Ok(ProblemDims {
            batch,
            heads,
            seq,
            total,
            head,
            v_head,
        })
    }
}

/// Result of one kernel execution.
#[derive(Debug, Clone)]
pub struct KernelOutput {
    /// `[batch, heads, seq, v_head]` in the query dtype.
    pub context: Tensor,
    /// `[batch, heads, seq, total]` when requested.
    pub attention_scores: Option<Tensor>,
}

/// A compute backend for one [`KernelCandidate`].
///
/// The selector checks the candidate's static predicate and the toggles; a
/// backend may narrow applicability further through [`supports`](Self::supports).
pub trait AttentionKernel: Send + Sync + Debug {
    fn candidate(&self) -> KernelCandidate;

    /// Backend-specific restrictions beyond the candidate's static predicate.
    fn supports(&self, _ctx: &SelectionContext) -> bool {
        true
    }

    /// Whether the backend delegates to a vendor library.
    fn is_vendor_library(&self) -> bool {
        false
    }

    fn attend(&self, problem: &AttentionProblem) -> Result<KernelOutput, AttentionError>;
}
