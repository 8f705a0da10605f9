use candle_core::Tensor;

use super::MASK_DTYPE;
use crate::core::AttentionError;
use crate::layout::ResolvedLayout;

/// Check an additive bias against `[1|batch, 1|heads, seq, total]` and cast
/// it to [`MASK_DTYPE`].
pub fn conform_additive(
    bias: &Tensor,
    layout: &ResolvedLayout,
    name: &str,
) -> Result<Tensor, AttentionError> {
    let batch = layout.batch_size;
    let heads = layout.num_heads;
    let seq = layout.sequence_length;
    let total = layout.total_sequence_length;
    let (bb, bh, bs, bt) = bias.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must be [1|{batch}, 1|{heads}, {seq}, {total}], got {:?}",
            bias.dims()
        ))
    })?;
    if (bb != 1 && bb != batch) || (bh != 1 && bh != heads) || bs != seq || bt != total {
        return Err(AttentionError::shape(format!(
            "{name} must be [1|{batch}, 1|{heads}, {seq}, {total}], got [{bb}, {bh}, {bs}, {bt}]"
        )));
    }
    Ok(bias.to_dtype(MASK_DTYPE)?)
}

/// Union of two masking biases: a position masked by either carries `fill`
/// exactly once, whatever its sign.
pub fn union(
    left: Option<Tensor>,
    right: Option<Tensor>,
    fill: f32,
) -> Result<Option<Tensor>, AttentionError> {
    let (left, right) = match (left, right) {
        (Some(left), Some(right)) => (left, right),
        (left, right) => return Ok(left.or(right)),
    };
    let masked = left.ne(0f32)?.broadcast_maximum(&right.ne(0f32)?)?;
    let filled = Tensor::full(fill, masked.dims(), masked.device())?;
    let open = filled.zeros_like()?;
    Ok(Some(masked.where_cond(&filled, &open)?))
}

/// Sum of two additive biases.
pub fn sum(left: Option<Tensor>, right: Option<Tensor>) -> Result<Option<Tensor>, AttentionError> {
    Ok(match (left, right) {
        (Some(left), Some(right)) => Some(left.broadcast_add(&right)?),
        (left, right) => left.or(right),
    })
}
