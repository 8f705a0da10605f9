//! Shape-only classification of attention inputs.

use candle_core::{DType, Tensor};

use super::{AttentionInputs, CacheMode, LayoutVariant, Precision};
use crate::core::{AttentionConfig, AttentionError};

/// Canonical dimensions derived from one request.
///
/// `total_sequence_length` is the number of key positions attended to
/// (`past + kv`). When past and present share a buffer the present tensors
/// span `max_sequence_length` instead; see
/// [`present_sequence_length`](Self::present_sequence_length).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayout {
    pub variant: LayoutVariant,
    pub cache_mode: CacheMode,
    pub precision: Precision,
    pub dtype: DType,
    pub batch_size: usize,
    pub num_heads: usize,
    pub sequence_length: usize,
    pub kv_sequence_length: usize,
    pub past_sequence_length: usize,
    pub total_sequence_length: usize,
    pub max_sequence_length: Option<usize>,
    pub hidden_size: usize,
    pub v_hidden_size: usize,
    pub head_size: usize,
    pub v_head_size: usize,
    /// Key/value arrived as `[batch, heads, kv_seq, head]` rather than projections.
    pub kv_in_cache_layout: bool,
}

impl ResolvedLayout {
    /// Sequence extent of the emitted present key/value.
    pub fn present_sequence_length(&self) -> usize {
        match self.cache_mode {
            CacheMode::BufferShared => self
                .max_sequence_length
                .unwrap_or(self.total_sequence_length),
            _ => self.total_sequence_length,
        }
    }

    /// Queries and keys come from different sequences.
    pub fn is_cross_attention(&self) -> bool {
        match self.cache_mode {
            CacheMode::StaticPast => true,
            CacheMode::IncrementalAppend | CacheMode::BufferShared => false,
            CacheMode::NoCache => {
                self.variant == LayoutVariant::PackedKv
                    || (self.variant == LayoutVariant::Separate
                        && self.kv_sequence_length != self.sequence_length)
            }
        }
    }
}

/// Where key/value dimensions come from once the query is classified.
struct KvShape {
    variant: LayoutVariant,
    kv_sequence_length: usize,
    v_hidden_size: usize,
    cache_layout: bool,
    from_past: bool,
}

/// Determine the active layout and derive every secondary dimension.
///
/// Pure function of tensor shapes and dtypes; no tensor data is read.
pub fn resolve(
    inputs: &AttentionInputs,
    config: &AttentionConfig,
) -> Result<ResolvedLayout, AttentionError> {
    let num_heads = config.num_heads;
    if num_heads == 0 {
        return Err(AttentionError::InvalidConfig(
            "num_heads must be greater than zero".to_string(),
        ));
    }

    let dtype = inputs.query.dtype();
    let precision = Precision::from_dtype(dtype).ok_or_else(|| {
        AttentionError::unsupported(format!("query dtype {dtype:?} is not floating point"))
    })?;

    let (batch_size, sequence_length, hidden_size, kv) = match *inputs.query.dims() {
        [batch, seq, heads, slots, head] => {
            if slots != 3 {
                return Err(AttentionError::shape(format!(
                    "packed qkv expects 3 slots per head, got {slots}"
                )));
            }
            if heads != num_heads {
                return Err(AttentionError::shape(format!(
                    "packed qkv carries {heads} heads, num_heads is {num_heads}"
                )));
            }
            if inputs.key.is_some() || inputs.value.is_some() {
                return Err(AttentionError::shape(
                    "packed qkv is mutually exclusive with key and value",
                ));
            }
            let hidden = heads * head;
            let kv = KvShape {
                variant: LayoutVariant::PackedQkv,
                kv_sequence_length: seq,
                v_hidden_size: hidden,
                cache_layout: false,
                from_past: false,
            };
            (batch, seq, hidden, kv)
        }
        [batch, seq, hidden] => {
            if hidden % num_heads != 0 {
                return Err(AttentionError::shape(format!(
                    "hidden size {hidden} is not divisible by num_heads {num_heads}"
                )));
            }
            let kv = resolve_key_value(inputs, batch, hidden, num_heads, dtype)?;
            (batch, seq, hidden, kv)
        }
        _ => {
            return Err(AttentionError::shape(format!(
                "query must be [batch, seq, hidden] or [batch, seq, heads, 3, head], got {:?}",
                inputs.query.dims()
            )));
        }
    };

    let head_size = hidden_size / num_heads;
    if kv.v_hidden_size % num_heads != 0 {
        return Err(AttentionError::shape(format!(
            "value hidden size {} is not divisible by num_heads {num_heads}",
            kv.v_hidden_size
        )));
    }
    let v_head_size = kv.v_hidden_size / num_heads;

    if let Some(bias) = &inputs.bias {
        let expected = 2 * hidden_size + kv.v_hidden_size;
        if bias.dims() != [expected] {
            return Err(AttentionError::shape(format!(
                "bias must be [{expected}], got {:?}",
                bias.dims()
            )));
        }
    }

    let mut layout = ResolvedLayout {
        variant: kv.variant,
        cache_mode: CacheMode::NoCache,
        precision,
        dtype,
        batch_size,
        num_heads,
        sequence_length,
        kv_sequence_length: kv.kv_sequence_length,
        past_sequence_length: 0,
        total_sequence_length: kv.kv_sequence_length,
        max_sequence_length: None,
        hidden_size,
        v_hidden_size: kv.v_hidden_size,
        head_size,
        v_head_size,
        kv_in_cache_layout: kv.cache_layout,
    };

    let past_capacity = validate_past(inputs, &layout)?;
    match past_capacity {
        None if kv.cache_layout => layout.cache_mode = CacheMode::StaticPast,
        None => {
            if let Some(len) = inputs.past_sequence_length.filter(|len| *len > 0) {
                return Err(AttentionError::shape(format!(
                    "past_sequence_length {len} supplied without past key/value"
                )));
            }
        }
        Some(capacity) if kv.from_past => {
            let filled = inputs.past_sequence_length.unwrap_or(capacity);
            if filled > capacity {
                return Err(AttentionError::shape(format!(
                    "past_sequence_length {filled} exceeds past extent {capacity}"
                )));
            }
            layout.cache_mode = CacheMode::StaticPast;
            layout.kv_sequence_length = filled;
            layout.total_sequence_length = filled;
        }
        Some(capacity) if config.past_present_share_buffer => {
            let past = inputs.past_sequence_length.ok_or_else(|| {
                AttentionError::shape(
                    "past_sequence_length is required when past and present share a buffer",
                )
            })?;
            layout.cache_mode = CacheMode::BufferShared;
            layout.past_sequence_length = past;
            layout.total_sequence_length = past + layout.kv_sequence_length;
            layout.max_sequence_length = Some(capacity);
        }
        Some(capacity) => {
            let past = inputs.past_sequence_length.unwrap_or(capacity);
            if past > capacity {
                return Err(AttentionError::shape(format!(
                    "past_sequence_length {past} exceeds past extent {capacity}"
                )));
            }
            layout.cache_mode = CacheMode::IncrementalAppend;
            layout.past_sequence_length = past;
            layout.total_sequence_length = past + layout.kv_sequence_length;
        }
    }

    Ok(layout)
}

fn resolve_key_value(
    inputs: &AttentionInputs,
    batch: usize,
    hidden: usize,
    num_heads: usize,
    dtype: DType,
) -> Result<KvShape, AttentionError> {
    let head_size = hidden / num_heads;
    let Some(key) = &inputs.key else {
        if inputs.value.is_some() {
            return Err(AttentionError::shape("value supplied without key"));
        }
        let Some(past_key) = &inputs.past_key else {
            return Err(AttentionError::shape(
                "key is required unless query is packed or past key/value is supplied",
            ));
        };
        let past_value = inputs
            .past_value
            .as_ref()
            .ok_or_else(|| AttentionError::shape("past_key supplied without past_value"))?;
        let (_, _, extent, _) = past_key.dims4().map_err(|_| {
            AttentionError::shape(format!("past_key must be rank 4, got {:?}", past_key.dims()))
        })?;
        let (_, _, _, v_head) = past_value.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "past_value must be rank 4, got {:?}",
                past_value.dims()
            ))
        })?;
        return Ok(KvShape {
            variant: LayoutVariant::Separate,
            kv_sequence_length: extent,
            v_hidden_size: v_head * num_heads,
            cache_layout: false,
            from_past: true,
        });
    };
    expect_dtype(key, dtype, "key")?;

    match *key.dims() {
        [kb, kv_seq, heads, slots, head] => {
            if inputs.value.is_some() {
                return Err(AttentionError::shape(
                    "packed kv is mutually exclusive with value",
                ));
            }
            if kb != batch || heads != num_heads || slots != 2 || head != head_size {
                return Err(AttentionError::shape(format!(
                    "packed kv must be [{batch}, kv_seq, {num_heads}, 2, {head_size}], got {:?}",
                    key.dims()
                )));
            }
            Ok(KvShape {
                variant: LayoutVariant::PackedKv,
                kv_sequence_length: kv_seq,
                v_hidden_size: hidden,
                cache_layout: false,
                from_past: false,
            })
        }
        [kb, kv_seq, k_hidden] => {
            let value = inputs
                .value
                .as_ref()
                .ok_or_else(|| AttentionError::shape("separate key requires value"))?;
            expect_dtype(value, dtype, "value")?;
            if kb != batch || k_hidden != hidden {
                return Err(AttentionError::shape(format!(
                    "key must be [{batch}, kv_seq, {hidden}], got {:?}",
                    key.dims()
                )));
            }
            let (vb, v_seq, v_hidden) = value.dims3().map_err(|_| {
                AttentionError::shape(format!(
                    "value must be [batch, kv_seq, v_hidden], got {:?}",
                    value.dims()
                ))
            })?;
            if vb != batch || v_seq != kv_seq {
                return Err(AttentionError::shape(format!(
                    "value must be [{batch}, {kv_seq}, v_hidden], got {:?}",
                    value.dims()
                )));
            }
            Ok(KvShape {
                variant: LayoutVariant::Separate,
                kv_sequence_length: kv_seq,
                v_hidden_size: v_hidden,
                cache_layout: false,
                from_past: false,
            })
        }
        [kb, heads, kv_seq, head] => {
            if inputs.past_key.is_some() || inputs.past_value.is_some() {
                return Err(AttentionError::shape(
                    "key in cache layout cannot be combined with past key/value",
                ));
            }
            let value = inputs
                .value
                .as_ref()
                .ok_or_else(|| AttentionError::shape("key in cache layout requires value"))?;
            expect_dtype(value, dtype, "value")?;
            if kb != batch || heads != num_heads || head != head_size {
                return Err(AttentionError::shape(format!(
                    "cached key must be [{batch}, {num_heads}, kv_seq, {head_size}], got {:?}",
                    key.dims()
                )));
            }
            let (vb, vh, v_seq, v_head) = value.dims4().map_err(|_| {
                AttentionError::shape(format!(
                    "cached value must be rank 4, got {:?}",
                    value.dims()
                ))
            })?;
            if vb != batch || vh != num_heads || v_seq != kv_seq {
                return Err(AttentionError::shape(format!(
                    "cached value must be [{batch}, {num_heads}, {kv_seq}, v_head], got {:?}",
                    value.dims()
                )));
            }
            Ok(KvShape {
                variant: LayoutVariant::Separate,
                kv_sequence_length: kv_seq,
                v_hidden_size: v_head * num_heads,
                cache_layout: true,
                from_past: false,
            })
        }
        _ => Err(AttentionError::shape(format!(
            "key must be rank 3, 4 or 5, got {:?}",
            key.dims()
        ))),
    }
}

/// Check past key/value against the resolved head geometry and return the
/// past sequence extent.
fn validate_past(
    inputs: &AttentionInputs,
    layout: &ResolvedLayout,
) -> Result<Option<usize>, AttentionError> {
    let (past_key, past_value) = match (&inputs.past_key, &inputs.past_value) {
        (None, None) => return Ok(None),
        (Some(key), Some(value)) => (key, value),
        _ => {
            return Err(AttentionError::shape(
                "past_key and past_value must be supplied together",
            ))
        }
    };
    expect_dtype(past_key, layout.dtype, "past_key")?;
    expect_dtype(past_value, layout.dtype, "past_value")?;

    let expected = [
        layout.batch_size,
        layout.num_heads,
        past_key.dims().get(2).copied().unwrap_or(0),
        layout.head_size,
    ];
    if past_key.dims() != expected {
        return Err(AttentionError::shape(format!(
            "past_key must be [{}, {}, past_seq, {}], got {:?}",
            layout.batch_size,
            layout.num_heads,
            layout.head_size,
            past_key.dims()
        )));
    }
    let expected_value = [
        layout.batch_size,
        layout.num_heads,
        expected[2],
        layout.v_head_size,
    ];
    if past_value.dims() != expected_value {
        return Err(AttentionError::shape(format!(
            "past_value must be {expected_value:?}, got {:?}",
            past_value.dims()
        )));
    }
    Ok(Some(expected[2]))
}

fn expect_dtype(tensor: &Tensor, dtype: DType, name: &str) -> Result<(), AttentionError> {
    if tensor.dtype() == dtype {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "{name} dtype {:?} differs from query dtype {dtype:?}",
            tensor.dtype()
        )))
    }
}
