//! Request normalization, kernel selection and key/value cache management in
//! front of multi-head attention kernels.
//!
//! Inputs arrive as separate query/key/value tensors, packed key/value, or
//! packed query/key/value, optionally with a projection bias, a key padding
//! mask in one of several encodings, an additive attention bias, and a past
//! key/value cache. [`MultiHeadAttention::forward`] resolves the layout,
//! folds every mask into one additive bias, advances the cache (by
//! concatenation, or in place when past and present share a buffer, with
//! optional beam-search reordering), and dispatches to the highest-priority
//! kernel that accepts the request.
//!
//! Kernels consume `[batch, n_heads, seq_len, head_dim]` tensors and must agree
//! with the unfused reference within 0.02 (full precision) or 0.05 (half
//! precision). Fused self, fused cross and flash kernels are external and are
//! registered through [`KernelRegistry`].

pub mod core;
pub mod fused;
pub mod kv_cache;
pub mod layout;
pub mod masks;
pub mod operator;
pub mod reference;
pub mod selector;

pub use crate::core::{
    AttentionConfig, AttentionError, AttentionKernel, AttentionProblem, DeviceKind,
    KernelOutput, KernelToggles, OperatorConfig, QkOutputMode,
};
pub use fused::MemoryEfficientAttention;
pub use kv_cache::{CacheIndirection, CacheManager, KvArena, KvCacheState};
pub use layout::{AttentionInputs, CacheMode, LayoutVariant, Precision, ResolvedLayout};
pub use masks::{AttentionMask, NormalizedBias};
pub use operator::{AttentionOutputs, MultiHeadAttention};
pub use reference::UnfusedAttention;
pub use selector::{KernelCandidate, KernelRegistry, KernelSelector, SelectionContext};
