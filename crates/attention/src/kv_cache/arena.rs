//! Session-owned key/value storage for buffer-shared decoding.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Pre-sized `[batch, heads, capacity, head]` key and value buffers.
///
/// The arena is allocated once per decoding session and handed to every step
/// as `past_key`/`past_value`. The cache manager writes into it in place and
/// never allocates or frees it.
#[derive(Debug, Clone)]
pub struct KvArena {
    key: Tensor,
    value: Tensor,
    capacity: usize,
}

impl KvArena {
    pub fn new(
        batch: usize,
        num_heads: usize,
        capacity: usize,
        head_size: usize,
        v_head_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, AttentionError> {
        if capacity == 0 {
            return Err(AttentionError::shape("kv arena capacity must be greater than zero"));
        }
        let key = Tensor::zeros((batch, num_heads, capacity, head_size), dtype, device)?;
        let value = Tensor::zeros((batch, num_heads, capacity, v_head_size), dtype, device)?;
        log::info!(
            "kv-arena init: batch={batch} heads={num_heads} capacity={capacity} head_size={head_size} v_head_size={v_head_size} dtype={dtype:?}"
        );
        Ok(Self {
            key,
            value,
            capacity,
        })
    }

    /// Handle to the key buffer; clones share storage.
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Filled prefix of both buffers.
    pub fn prefix(&self, len: usize) -> Result<(Tensor, Tensor), AttentionError> {
        if len > self.capacity {
            return Err(AttentionError::CapacityExceeded {
                required: len,
                capacity: self.capacity,
            });
        }
        Ok((self.key.narrow(2, 0, len)?, self.value.narrow(2, 0, len)?))
    }
}
