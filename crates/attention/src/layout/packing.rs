//! Conversion of every input layout to head-major `[batch, heads, seq, head]`.

use candle_core::{Tensor, D};

use super::{AttentionInputs, LayoutVariant, ResolvedLayout};
use crate::core::AttentionError;

/// Head-major projections for one request.
///
/// `key`/`value` are `None` when the request reads a static past and brings no
/// projections of its own.
#[derive(Debug, Clone)]
pub struct HeadTensors {
    /// `[batch, num_heads, seq, head_size]`
    pub query: Tensor,
    /// `[batch, num_heads, kv_seq, head_size]`
    pub key: Option<Tensor>,
    /// `[batch, num_heads, kv_seq, v_head_size]`
    pub value: Option<Tensor>,
}

struct SplitBias {
    query: Tensor,
    key: Tensor,
    value: Tensor,
}

/// Apply the projection bias and convert to head-major layout.
///
/// Must be called with the layout [`resolve`](super::resolve) produced for the
/// same inputs.
pub fn prepare_heads(
    inputs: &AttentionInputs,
    layout: &ResolvedLayout,
) -> Result<HeadTensors, AttentionError> {
    let bias = split_bias(inputs.bias.as_ref(), layout)?;
    let q_bias = bias.as_ref().map(|b| &b.query);
    let k_bias = bias.as_ref().map(|b| &b.key);
    let v_bias = bias.as_ref().map(|b| &b.value);

    match layout.variant {
        LayoutVariant::PackedQkv => {
            let packed = &inputs.query;
            Ok(HeadTensors {
                query: head_major(&unpack_slot(packed, 0)?, q_bias)?,
                key: Some(head_major(&unpack_slot(packed, 1)?, k_bias)?),
                value: Some(head_major(&unpack_slot(packed, 2)?, v_bias)?),
            })
        }
        LayoutVariant::PackedKv => {
            let query = split_heads(&inputs.query, layout.num_heads, layout.head_size)?;
            let packed = inputs
                .key
                .as_ref()
                .ok_or_else(|| AttentionError::shape("packed kv layout without key tensor"))?;
            Ok(HeadTensors {
                query: head_major(&query, q_bias)?,
                key: Some(head_major(&unpack_slot(packed, 0)?, k_bias)?),
                value: Some(head_major(&unpack_slot(packed, 1)?, v_bias)?),
            })
        }
        LayoutVariant::Separate => {
            let query = split_heads(&inputs.query, layout.num_heads, layout.head_size)?;
            let query = head_major(&query, q_bias)?;
            let (key, value) = match (&inputs.key, &inputs.value) {
                (Some(key), Some(value)) if layout.kv_in_cache_layout => {
                    (Some(key.contiguous()?), Some(value.contiguous()?))
                }
                (Some(key), Some(value)) => {
                    let key = split_heads(key, layout.num_heads, layout.head_size)?;
                    let value = split_heads(value, layout.num_heads, layout.v_head_size)?;
                    (
                        Some(head_major(&key, k_bias)?),
                        Some(head_major(&value, v_bias)?),
                    )
                }
                _ => (None, None),
            };
            Ok(HeadTensors { query, key, value })
        }
    }
}

/// `[batch, seq, heads * head]` to `[batch, seq, heads, head]`.
fn split_heads(tensor: &Tensor, num_heads: usize, head_size: usize) -> Result<Tensor, AttentionError> {
    let (batch, seq, _) = tensor.dims3()?;
    Ok(tensor.reshape((batch, seq, num_heads, head_size))?)
}

/// Slot `slot` of a packed `[batch, seq, heads, slots, head]` tensor.
fn unpack_slot(packed: &Tensor, slot: usize) -> Result<Tensor, AttentionError> {
    Ok(packed.narrow(3, slot, 1)?.squeeze(3)?)
}

/// `[batch, seq, heads, head]` plus optional `[heads, head]` bias to
/// contiguous `[batch, heads, seq, head]`.
fn head_major(tensor: &Tensor, bias: Option<&Tensor>) -> Result<Tensor, AttentionError> {
    let tensor = match bias {
        Some(bias) => tensor.broadcast_add(bias)?,
        None => tensor.clone(),
    };
    Ok(tensor.transpose(1, 2)?.contiguous()?)
}

fn split_bias(
    bias: Option<&Tensor>,
    layout: &ResolvedLayout,
) -> Result<Option<SplitBias>, AttentionError> {
    let Some(bias) = bias else {
        return Ok(None);
    };
    let bias = bias.to_dtype(layout.dtype)?;
    let hidden = layout.hidden_size;
    let heads = layout.num_heads;
    let query = bias.narrow(D::Minus1, 0, hidden)?;
    let key = bias.narrow(D::Minus1, hidden, hidden)?;
    let value = bias.narrow(D::Minus1, 2 * hidden, layout.v_hidden_size)?;
    Ok(Some(SplitBias {
        query: query.reshape((heads, layout.head_size))?,
        key: key.reshape((heads, layout.head_size))?,
        value: value.reshape((heads, layout.v_head_size))?,
    }))
}
