//! Kernel selection.
//!
//! Candidates are tried in [`KernelCandidate::PRIORITY`] order. A candidate
//! qualifies when its static predicate admits the request, its toggle is on,
//! and a backend for it is registered and accepts the request. Forcing
//! `Unfused` always wins; forcing any other candidate leaves it as the only
//! option.

mod candidate;
mod policy;

pub use candidate::{
    KernelCandidate, MaskKind, SelectionContext, FLASH_MAX_HEAD_SIZE, FUSED_CROSS_MAX_HEAD_SIZE,
    FUSED_SELF_MAX_HEAD_SIZE, FUSED_SELF_MAX_SEQ_LEN, MEMORY_EFFICIENT_MAX_HEAD_SIZE,
};
pub use policy::{KernelRegistry, KernelSelector};
