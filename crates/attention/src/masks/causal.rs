//! Causal bias for unidirectional attention.
//!
//! The result has dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[1, 1, q_len, k_len]`, broadcasting over batch and heads.

use candle_core::{Device, Result, Tensor};

/// Construct a causal bias for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries align with the most recent `q_len` keys, so
/// a decode step still sees the whole cached prefix.
pub fn causal_bias(device: &Device, q_len: usize, k_len: usize, fill: f32) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * k_len];
    let offset = k_len.saturating_sub(q_len);

    for q in 0..q_len {
        let row_start = q * k_len;
        let max_k = q + offset;
        for k in (max_k + 1)..k_len {
            data[row_start + k] = fill;
        }
    }

    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
