//! Mask and attention-bias normalization.
//!
//! Every mask encoding is reduced to a single additive bias of dtype
//! [`MASK_DTYPE`] shaped `[1|batch, 1|num_heads, seq, total_seq]`. Masked
//! positions carry the configured `mask_filter_value`; the value is never
//! clamped here. An explicit attention bias is added on top of any
//! mask-derived bias.

pub mod bias;
pub mod causal;
pub mod key_padding;

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionConfig, AttentionError};
use crate::layout::ResolvedLayout;
use crate::selector::MaskKind;

pub use causal::causal_bias;
pub use key_padding::{bias_from_lengths, bias_from_ranges, bias_from_validity, RawIndexMask};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Decoded key padding mask.
#[derive(Debug, Clone)]
pub enum AttentionMask {
    None,
    /// `[batch]` valid key lengths.
    KeyLengths(Vec<usize>),
    /// `[batch, total_seq]` validity, `true` where the key may be attended.
    /// A `[batch, kv_seq]` input is widened with a valid past prefix.
    KeyPadding(Vec<Vec<bool>>),
    /// `[3 * batch + 2]` index encoding.
    RawIndex(RawIndexMask),
    /// Float `[1|batch, 1|heads, seq, total_seq]` bias passed as a mask.
    AdditiveBias(Tensor),
}

impl AttentionMask {
    pub fn kind(&self) -> MaskKind {
        match self {
            AttentionMask::None => MaskKind::None,
            AttentionMask::KeyLengths(_) => MaskKind::KeyLengths,
            AttentionMask::KeyPadding(_) => MaskKind::KeyPadding,
            AttentionMask::RawIndex(_) => MaskKind::RawIndex,
            AttentionMask::AdditiveBias(_) => MaskKind::Additive,
        }
    }
}

/// Additive bias ready for a kernel, or nothing to add.
#[derive(Debug, Clone)]
pub enum NormalizedBias {
    None,
    Additive(Tensor),
}

impl NormalizedBias {
    pub fn is_none(&self) -> bool {
        matches!(self, NormalizedBias::None)
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            NormalizedBias::None => None,
            NormalizedBias::Additive(bias) => Some(bias),
        }
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            NormalizedBias::None => None,
            NormalizedBias::Additive(bias) => Some(bias),
        }
    }
}

/// Identify the encoding of `mask` from its rank and length.
pub fn classify(
    mask: Option<&Tensor>,
    layout: &ResolvedLayout,
) -> Result<AttentionMask, AttentionError> {
    let Some(mask) = mask else {
        return Ok(AttentionMask::None);
    };
    let batch = layout.batch_size;
    let total = layout.total_sequence_length;

    match *mask.dims() {
        [len] if len == batch => {
            let lengths = integer_values(mask)?
                .into_iter()
                .map(|value| {
                    usize::try_from(value).map_err(|_| {
                        AttentionError::shape(format!("key length {value} is negative"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AttentionMask::KeyLengths(lengths))
        }
        [len] if len == 3 * batch + 2 => {
            let values = integer_values(mask)?;
            Ok(AttentionMask::RawIndex(RawIndexMask::decode(&values, batch)?))
        }
        [mb, mt] => {
            let kv = layout.kv_sequence_length;
            if mb != batch || (mt != total && mt != kv) {
                return Err(AttentionError::shape(format!(
                    "2-D key padding mask must be [{batch}, {total}] or [{batch}, {kv}], got [{mb}, {mt}]"
                )));
            }
            // A `[batch, kv_seq]` mask covers the newest keys; the past stays valid.
            let past = total - mt;
            let values = integer_values(mask)?;
            let rows = values
                .chunks(mt.max(1))
                .take(batch)
                .map(|row| {
                    std::iter::repeat(true)
                        .take(past)
                        .chain(row.iter().map(|value| *value != 0))
                        .collect()
                })
                .collect();
            Ok(AttentionMask::KeyPadding(rows))
        }
        [_, _, _, _] => Ok(AttentionMask::AdditiveBias(bias::conform_additive(
            mask,
            layout,
            "4-D mask",
        )?)),
        _ => Err(AttentionError::shape(format!(
            "key padding mask must be [{batch}], [{}], [{batch}, {total}], [{batch}, {}] or 4-D, got {:?}",
            3 * batch + 2,
            layout.kv_sequence_length,
            mask.dims()
        ))),
    }
}

/// Fold the mask, the causal restriction and the explicit attention bias into
/// one additive tensor.
pub fn normalize(
    mask: &AttentionMask,
    attention_bias: Option<&Tensor>,
    layout: &ResolvedLayout,
    config: &AttentionConfig,
    device: &Device,
) -> Result<NormalizedBias, AttentionError> {
    let seq = layout.sequence_length;
    let total = layout.total_sequence_length;
    let fill = config.mask_filter_value;

    let key_mask = match mask {
        AttentionMask::None | AttentionMask::AdditiveBias(_) => None,
        AttentionMask::KeyLengths(lengths) => {
            Some(bias_from_lengths(device, lengths, seq, total, fill)?)
        }
        AttentionMask::KeyPadding(valid) => Some(bias_from_validity(device, valid, seq, fill)?),
        AttentionMask::RawIndex(raw) => {
            Some(bias_from_ranges(device, &raw.ranges(total), seq, total, fill)?)
        }
    };
    let causal = if config.unidirectional {
        Some(causal_bias(device, seq, total, fill)?)
    } else {
        None
    };
    let masked = bias::union(key_mask, causal, fill)?;

    let mask_bias = match mask {
        AttentionMask::AdditiveBias(bias) => Some(bias.clone()),
        _ => None,
    };
    let explicit = attention_bias
        .map(|bias| bias::conform_additive(bias, layout, "attention_bias"))
        .transpose()?;

    let combined = bias::sum(bias::sum(masked, mask_bias)?, explicit)?;
    Ok(match combined {
        Some(bias) => NormalizedBias::Additive(bias),
        None => NormalizedBias::None,
    })
}

fn integer_values(mask: &Tensor) -> Result<Vec<i64>, AttentionError> {
    Ok(mask.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?)
}

#[cfg(test)]
mod tests;
