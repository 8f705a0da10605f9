//! Input layout detection and head-major normalization.
//!
//! Callers hand over query/key/value in one of three interchangeable layouts:
//!
//! * separate tensors: query `[batch, seq, hidden]`, key `[batch, kv_seq, hidden]`,
//!   value `[batch, kv_seq, v_hidden]`;
//! * packed key/value: key `[batch, kv_seq, num_heads, 2, head_size]`, no value;
//! * packed query/key/value: query `[batch, seq, num_heads, 3, head_size]`, no
//!   key or value.
//!
//! Key and value may also arrive already in cache layout
//! `[batch, num_heads, kv_seq, head_size]`, which marks them as a static past.
//! [`resolve`] classifies the request without touching tensor data and
//! [`prepare_heads`] converts every variant to `[batch, heads, seq, head]`.

mod inputs;
mod packing;
mod resolver;

pub use inputs::AttentionInputs;
pub use packing::{prepare_heads, HeadTensors};
pub use resolver::{resolve, ResolvedLayout};

use candle_core::DType;

/// Which of the interchangeable input layouts is active for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutVariant {
    Separate,
    PackedKv,
    PackedQkv,
}

/// Cache lifecycle state for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// No past supplied; attention runs directly over key/value.
    NoCache,
    /// Past key/value is the complete, unchanging key/value (cross-attention).
    StaticPast,
    /// New tokens are concatenated after the past into a fresh present.
    IncrementalAppend,
    /// New tokens are written in place into the caller's pre-sized buffer.
    BufferShared,
}

impl CacheMode {
    /// Whether the invocation appends new key/value rows to a past.
    pub fn appends(self) -> bool {
        matches!(self, CacheMode::IncrementalAppend | CacheMode::BufferShared)
    }
}

/// Numeric precision class of a request, derived from the query dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Half,
    Full,
}

impl Precision {
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F16 | DType::BF16 => Some(Precision::Half),
            DType::F32 | DType::F64 => Some(Precision::Full),
            _ => None,
        }
    }

    /// Absolute tolerance that conforming kernels must meet against the
    /// reference.
    pub fn tolerance(self) -> f32 {
        match self {
            Precision::Half => 0.05,
            Precision::Full => 0.02,
        }
    }
}
