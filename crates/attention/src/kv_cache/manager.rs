use candle_core::Tensor;

use super::{gather_beams, CacheIndirection};
use crate::core::AttentionError;
use crate::layout::{AttentionInputs, CacheMode, HeadTensors, ResolvedLayout};

/// Past/present key/value for one invocation.
///
/// `key`/`value` are what the kernel attends over, with any beam reordering
/// applied. The present tensors never carry that reordering: they alias the
/// past storage in [`CacheMode::BufferShared`] and [`CacheMode::StaticPast`],
/// and are fresh tensors otherwise.
#[derive(Debug, Clone)]
pub struct KvCacheState {
    pub mode: CacheMode,
    pub past_key: Option<Tensor>,
    pub past_value: Option<Tensor>,
    pub present_key: Option<Tensor>,
    pub present_value: Option<Tensor>,
    pub past_sequence_length: usize,
    pub max_sequence_length: Option<usize>,
    pub buffer_share: bool,
    key: Tensor,
    value: Tensor,
}

impl KvCacheState {
    /// `[batch, heads, total, head]`
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    /// `[batch, heads, total, v_head]`
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn into_present(self) -> (Option<Tensor>, Option<Tensor>) {
        (self.present_key, self.present_value)
    }
}

/// Runs the cache state machine for one invocation.
///
/// Stateless: everything that persists across steps lives in the tensors the
/// caller threads back in as the next past.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheManager;

impl CacheManager {
    pub fn new() -> Self {
        Self
    }

    /// Produce the attended key/value and the present outputs.
    ///
    /// In [`CacheMode::BufferShared`] the new rows are written in place at
    /// `past_sequence_length` before this returns. The cache indirection is a
    /// cumulative lineage map and is only read through, so existing rows are
    /// never rewritten.
    pub fn resolve(
        &self,
        layout: &ResolvedLayout,
        heads: &HeadTensors,
        inputs: &AttentionInputs,
    ) -> Result<KvCacheState, AttentionError> {
        let indirection = inputs
            .cache_indirection
            .as_ref()
            .map(CacheIndirection::from_tensor)
            .transpose()?;
        if indirection.is_some() && !layout.cache_mode.appends() {
            log::debug!(
                "cache indirection ignored for cache mode {:?}",
                layout.cache_mode
            );
        }
        if let Some(indirection) = &indirection {
            let rows = indirection.batch() * indirection.num_beams();
            if layout.cache_mode.appends() && rows != layout.batch_size {
                return Err(AttentionError::shape(format!(
                    "cache indirection covers {rows} rows, batch is {}",
                    layout.batch_size
                )));
            }
        }

        match layout.cache_mode {
            CacheMode::NoCache => self.no_cache(heads, inputs.output_present),
            CacheMode::StaticPast => self.static_past(layout, heads, inputs),
            CacheMode::IncrementalAppend => {
                self.append(layout, heads, inputs, indirection.as_ref())
            }
            CacheMode::BufferShared => {
                self.append_in_place(layout, heads, inputs, indirection.as_ref())
            }
        }
    }

    fn no_cache(
        &self,
        heads: &HeadTensors,
        emit_present: bool,
    ) -> Result<KvCacheState, AttentionError> {
        let (key, value) = new_rows(heads)?;
        let (present_key, present_value) = if emit_present {
            (Some(key.copy()?), Some(value.copy()?))
        } else {
            (None, None)
        };
        Ok(KvCacheState {
            mode: CacheMode::NoCache,
            past_key: None,
            past_value: None,
            present_key,
            present_value,
            past_sequence_length: 0,
            max_sequence_length: None,
            buffer_share: false,
            key: key.clone(),
            value: value.clone(),
        })
    }

    fn static_past(
        &self,
        layout: &ResolvedLayout,
        heads: &HeadTensors,
        inputs: &AttentionInputs,
    ) -> Result<KvCacheState, AttentionError> {
        let (past_key, past_value) = match (&heads.key, &heads.value) {
            (Some(key), Some(value)) => (key.clone(), value.clone()),
            _ => past_pair(inputs)?,
        };
        let filled = layout.kv_sequence_length;
        Ok(KvCacheState {
            mode: CacheMode::StaticPast,
            key: past_key.narrow(2, 0, filled)?,
            value: past_value.narrow(2, 0, filled)?,
            present_key: Some(past_key.clone()),
            present_value: Some(past_value.clone()),
            past_key: Some(past_key),
            past_value: Some(past_value),
            past_sequence_length: 0,
            max_sequence_length: None,
            buffer_share: false,
        })
    }

    fn append(
        &self,
        layout: &ResolvedLayout,
        heads: &HeadTensors,
        inputs: &AttentionInputs,
        indirection: Option<&CacheIndirection>,
    ) -> Result<KvCacheState, AttentionError> {
        let (past_key, past_value) = past_pair(inputs)?;
        let (new_key, new_value) = new_rows(heads)?;
        let past_len = layout.past_sequence_length;

        let (present_key, present_value) = if past_len == 0 {
            (new_key.copy()?, new_value.copy()?)
        } else {
            (
                Tensor::cat(&[&past_key.narrow(2, 0, past_len)?, new_key], 2)?,
                Tensor::cat(&[&past_value.narrow(2, 0, past_len)?, new_value], 2)?,
            )
        };
        let (key, value) = match indirection.filter(|_| past_len > 0) {
            Some(indirection) => (
                Tensor::cat(&[&gather_beams(&past_key, past_len, indirection)?, new_key], 2)?,
                Tensor::cat(&[&gather_beams(&past_value, past_len, indirection)?, new_value], 2)?,
            ),
            None => (present_key.clone(), present_value.clone()),
        };

        Ok(KvCacheState {
            mode: CacheMode::IncrementalAppend,
            key,
            value,
            present_key: Some(present_key),
            present_value: Some(present_value),
            past_key: Some(past_key),
            past_value: Some(past_value),
            past_sequence_length: past_len,
            max_sequence_length: None,
            buffer_share: false,
        })
    }

    fn append_in_place(
        &self,
        layout: &ResolvedLayout,
        heads: &HeadTensors,
        inputs: &AttentionInputs,
        indirection: Option<&CacheIndirection>,
    ) -> Result<KvCacheState, AttentionError> {
        let (past_key, past_value) = past_pair(inputs)?;
        let (new_key, new_value) = new_rows(heads)?;
        let past_len = layout.past_sequence_length;
        let capacity = layout
            .max_sequence_length
            .unwrap_or_else(|| past_key.dims()[2]);
        let required = past_len + layout.kv_sequence_length;
        if required > capacity {
            return Err(AttentionError::CapacityExceeded { required, capacity });
        }
        if !past_key.is_contiguous() || !past_value.is_contiguous() {
            return Err(AttentionError::shape(
                "shared past buffers must be contiguous",
            ));
        }

        past_key.slice_set(&new_key.contiguous()?, 2, past_len)?;
        past_value.slice_set(&new_value.contiguous()?, 2, past_len)?;

        let (key, value) = match indirection.filter(|_| past_len > 0) {
            Some(indirection) => (
                Tensor::cat(&[&gather_beams(&past_key, past_len, indirection)?, new_key], 2)?,
                Tensor::cat(&[&gather_beams(&past_value, past_len, indirection)?, new_value], 2)?,
            ),
            None => (
                past_key.narrow(2, 0, required)?,
                past_value.narrow(2, 0, required)?,
            ),
        };

        Ok(KvCacheState {
            mode: CacheMode::BufferShared,
            key,
            value,
            present_key: Some(past_key.clone()),
            present_value: Some(past_value.clone()),
            past_key: Some(past_key),
            past_value: Some(past_value),
            past_sequence_length: past_len,
            max_sequence_length: Some(capacity),
            buffer_share: true,
        })
    }
}

fn new_rows(heads: &HeadTensors) -> Result<(&Tensor, &Tensor), AttentionError> {
    match (&heads.key, &heads.value) {
        (Some(key), Some(value)) => Ok((key, value)),
        _ => Err(AttentionError::shape("key and value are required")),
    }
}

fn past_pair(inputs: &AttentionInputs) -> Result<(Tensor, Tensor), AttentionError> {
    match (&inputs.past_key, &inputs.past_value) {
        (Some(key), Some(value)) => Ok((key.clone(), value.clone())),
        _ => Err(AttentionError::shape("past key and value are required")),
    }
}
