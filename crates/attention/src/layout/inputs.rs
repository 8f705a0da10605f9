use candle_core::Tensor;

/// Raw operator inputs for one attention invocation.
///
/// Absent optional inputs are `None`, never zero-filled tensors. The bundle is
/// read-only to this crate except for buffer-shared past tensors, which are
/// written in place by the cache manager.
#[derive(Debug, Clone)]
pub struct AttentionInputs {
    /// `[batch, seq, hidden]`, or packed `[batch, seq, num_heads, 3, head_size]`.
    pub query: Tensor,
    /// `[batch, kv_seq, hidden]`, packed `[batch, kv_seq, num_heads, 2, head_size]`,
    /// or cache layout `[batch, num_heads, kv_seq, head_size]`.
    pub key: Option<Tensor>,
    /// `[batch, kv_seq, v_hidden]` or cache layout `[batch, num_heads, kv_seq, v_head_size]`.
    pub value: Option<Tensor>,
    /// Projection bias `[hidden + hidden + v_hidden]`.
    pub bias: Option<Tensor>,
    /// Integer key padding mask in any encoding accepted by
    /// [`classify`](crate::masks::classify).
    pub key_padding_mask: Option<Tensor>,
    /// Additive bias `[1|batch, 1|num_heads, seq, total_seq]`.
    pub attention_bias: Option<Tensor>,
    /// `[batch, num_heads, past_seq|max_seq, head_size]`.
    pub past_key: Option<Tensor>,
    pub past_value: Option<Tensor>,
    pub past_sequence_length: Option<usize>,
    /// Integer `[batch, num_beams, max_seq]` beam reorder map.
    pub cache_indirection: Option<Tensor>,
    /// Emit raw attention scores.
    pub output_qk: bool,
    /// Emit present key/value even when no past is supplied.
    pub output_present: bool,
}

impl AttentionInputs {
    pub fn new(query: Tensor) -> Self {
        Self {
            query,
            key: None,
            value: None,
            bias: None,
            key_padding_mask: None,
            attention_bias: None,
            past_key: None,
            past_value: None,
            past_sequence_length: None,
            cache_indirection: None,
            output_qk: false,
            output_present: false,
        }
    }

    pub fn with_key_value(mut self, key: Tensor, value: Tensor) -> Self {
        self.key = Some(key);
        self.value = Some(value);
        self
    }

    pub fn with_packed_kv(mut self, packed: Tensor) -> Self {
        self.key = Some(packed);
        self.value = None;
        self
    }

    pub fn with_bias(mut self, bias: Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_key_padding_mask(mut self, mask: Tensor) -> Self {
        self.key_padding_mask = Some(mask);
        self
    }

    pub fn with_attention_bias(mut self, bias: Tensor) -> Self {
        self.attention_bias = Some(bias);
        self
    }

    /// Attach past key/value. `sequence_length` is required when past and
    /// present share a buffer and defaults to the past length otherwise.
    pub fn with_past(
        mut self,
        key: Tensor,
        value: Tensor,
        sequence_length: Option<usize>,
    ) -> Self {
        self.past_key = Some(key);
        self.past_value = Some(value);
        self.past_sequence_length = sequence_length;
        self
    }

    pub fn with_cache_indirection(mut self, indirection: Tensor) -> Self {
        self.cache_indirection = Some(indirection);
        self
    }

    pub fn request_output_qk(mut self) -> Self {
        self.output_qk = true;
        self
    }

    pub fn request_present(mut self) -> Self {
        self.output_present = true;
        self
    }
}
