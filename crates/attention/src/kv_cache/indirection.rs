//! Beam-search cache indirection.
//!
//! The attention batch holds `batch * num_beams` rows. Row
//! `b * num_beams + beam` reads cached position `t` from row
//! `b * num_beams + table[b, beam, t]`.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Validated `[batch, num_beams, max_sequence_length]` beam map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIndirection {
    batch: usize,
    num_beams: usize,
    max_sequence_length: usize,
    table: Vec<u32>,
}

impl CacheIndirection {
    pub fn new(
        batch: usize,
        num_beams: usize,
        max_sequence_length: usize,
        table: Vec<u32>,
    ) -> Result<Self, AttentionError> {
        if num_beams == 0 {
            return Err(AttentionError::shape("cache indirection needs at least one beam"));
        }
        let expected = batch * num_beams * max_sequence_length;
        if table.len() != expected {
            return Err(AttentionError::shape(format!(
                "cache indirection [{batch}, {num_beams}, {max_sequence_length}] needs {expected} entries, got {}",
                table.len()
            )));
        }
        if let Some(bad) = table.iter().find(|&&beam| beam as usize >= num_beams) {
            return Err(AttentionError::shape(format!(
                "cache indirection entry {bad} out of range for {num_beams} beams"
            )));
        }
        Ok(Self {
            batch,
            num_beams,
            max_sequence_length,
            table,
        })
    }

    /// Read a `[batch, num_beams, max_seq]` integer tensor.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, AttentionError> {
        let (batch, num_beams, max_seq) = tensor.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "cache indirection must be [batch, num_beams, max_seq], got {:?}",
                tensor.dims()
            ))
        })?;
        let raw = tensor.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let table = raw
            .into_iter()
            .map(|beam| {
                u32::try_from(beam).map_err(|_| {
                    AttentionError::shape(format!("cache indirection entry {beam} out of range"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(batch, num_beams, max_seq, table)
    }

    /// Every beam reads its own history.
    pub fn identity(batch: usize, num_beams: usize, max_sequence_length: usize) -> Self {
        let table = (0..batch * num_beams)
            .flat_map(|row| std::iter::repeat((row % num_beams) as u32).take(max_sequence_length))
            .collect();
        Self {
            batch,
            num_beams,
            max_sequence_length,
            table,
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    /// Cache row holding position `t` of attention row `row`.
    pub fn source_row(&self, row: usize, t: usize) -> usize {
        let group = row / self.num_beams;
        let beam = self.table[row * self.max_sequence_length + t] as usize;
        group * self.num_beams + beam
    }
}

/// Reorder the first `past_len` positions of `cache` by the beam map.
///
/// `cache` is `[batch * num_beams, heads, seq >= past_len, head]`; the result
/// is a fresh `[batch * num_beams, heads, past_len, head]` tensor. Positions
/// at or beyond `past_len` are not read.
pub fn gather_beams(
    cache: &Tensor,
    past_len: usize,
    indirection: &CacheIndirection,
) -> Result<Tensor, AttentionError> {
    let (rows, heads, extent, head) = cache.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "cache must be [rows, heads, seq, head], got {:?}",
            cache.dims()
        ))
    })?;
    let expected_rows = indirection.batch * indirection.num_beams;
    if rows != expected_rows {
        return Err(AttentionError::shape(format!(
            "cache holds {rows} rows, indirection covers {expected_rows}"
        )));
    }
    if past_len > extent || past_len > indirection.max_sequence_length {
        return Err(AttentionError::shape(format!(
            "past length {past_len} exceeds cache extent {extent} or indirection length {}",
            indirection.max_sequence_length
        )));
    }
    if past_len == 0 {
        return Ok(cache.narrow(2, 0, 0)?);
    }

    // [rows * past_len, heads * head], one line per (row, position).
    let flat = cache
        .narrow(2, 0, past_len)?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((rows * past_len, heads * head))?;
    let index: Vec<u32> = (0..rows)
        .flat_map(|row| {
            (0..past_len).map(move |t| (indirection.source_row(row, t) * past_len + t) as u32)
        })
        .collect();
    let index = Tensor::from_vec(index, rows * past_len, cache.device())?;

    Ok(flat
        .index_select(&index, 0)?
        .reshape((rows, past_len, heads, head))?
        .transpose(1, 2)?
        .contiguous()?)
}
