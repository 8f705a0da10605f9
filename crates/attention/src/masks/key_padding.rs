//! Builders for key-padding biases.
//!
//! Every builder produces a `[batch, 1, q_len, k_len]` tensor of dtype
//! [`MASK_DTYPE`](super::MASK_DTYPE): `0.0` where a key is valid and the
//! caller's fill value where it is padding.

use std::ops::Range;

use candle_core::{Device, Result, Tensor};

use crate::core::AttentionError;

/// Decoded `[3 * batch + 2]` index mask.
///
/// Layout: `key_seqlen[batch]`, then cumulative query offsets `[batch + 1]`,
/// then cumulative key offsets `[batch + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIndexMask {
    key_lengths: Vec<usize>,
    query_offsets: Vec<usize>,
    key_offsets: Vec<usize>,
}

impl RawIndexMask {
    pub fn decode(values: &[i64], batch: usize) -> std::result::Result<Self, AttentionError> {
        if values.len() != 3 * batch + 2 {
            return Err(AttentionError::shape(format!(
                "index mask must hold {} entries for batch {batch}, got {}",
                3 * batch + 2,
                values.len()
            )));
        }
        let as_usize = |value: i64| {
            usize::try_from(value).map_err(|_| {
                AttentionError::shape(format!("index mask entry {value} is negative"))
            })
        };
        let decoded: Vec<usize> = values
            .iter()
            .map(|value| as_usize(*value))
            .collect::<std::result::Result<_, _>>()?;

        let key_lengths = decoded[..batch].to_vec();
        let query_offsets = decoded[batch..2 * batch + 1].to_vec();
        let key_offsets = decoded[2 * batch + 1..].to_vec();
        for (name, offsets) in [("query", &query_offsets), ("key", &key_offsets)] {
            if offsets.windows(2).any(|pair| pair[1] < pair[0]) {
                return Err(AttentionError::shape(format!(
                    "cumulative {name} offsets must be non-decreasing, got {offsets:?}"
                )));
            }
        }
        Ok(Self {
            key_lengths,
            query_offsets,
            key_offsets,
        })
    }

    pub fn key_lengths(&self) -> &[usize] {
        &self.key_lengths
    }

    pub fn query_offsets(&self) -> &[usize] {
        &self.query_offsets
    }

    pub fn key_offsets(&self) -> &[usize] {
        &self.key_offsets
    }

    /// Valid key range for each batch row, clamped to `k_len`.
    pub fn ranges(&self, k_len: usize) -> Vec<Range<usize>> {
        self.key_lengths
            .iter()
            .map(|&len| 0..len.min(k_len))
            .collect()
    }
}

/// Keys at or beyond each row's valid length are masked.
pub fn bias_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
    fill: f32,
) -> Result<Tensor> {
    materialize(device, key_lengths.len(), q_len, k_len, fill, |b, k| {
        k < key_lengths[b]
    })
}

/// Keys outside each row's range are masked.
pub fn bias_from_ranges(
    device: &Device,
    ranges: &[Range<usize>],
    q_len: usize,
    k_len: usize,
    fill: f32,
) -> Result<Tensor> {
    materialize(device, ranges.len(), q_len, k_len, fill, |b, k| {
        ranges[b].contains(&k)
    })
}

/// `valid[b][k]` false marks a padded key. Rows must share one length.
pub fn bias_from_validity(
    device: &Device,
    valid: &[Vec<bool>],
    q_len: usize,
    fill: f32,
) -> Result<Tensor> {
    let k_len = valid.first().map_or(0, Vec::len);
    if let Some(row) = valid.iter().find(|row| row.len() != k_len) {
        candle_core::bail!(
            "all validity rows must share k_len {k_len}, found {}",
            row.len()
        );
    }
    materialize(device, valid.len(), q_len, k_len, fill, |b, k| valid[b][k])
}

fn materialize(
    device: &Device,
    batch: usize,
    q_len: usize,
    k_len: usize,
    fill: f32,
    is_valid: impl Fn(usize, usize) -> bool,
) -> Result<Tensor> {
    let mut data = vec![0f32; batch * q_len * k_len];
    for b in 0..batch {
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            for k in 0..k_len {
                if !is_valid(b, k) {
                    data[row_start + k] = fill;
                }
            }
        }
    }
    Tensor::from_vec(data, (batch, 1, q_len, k_len), device)
}
