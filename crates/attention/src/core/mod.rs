//! Core types shared across the orchestration layer and compute backends.
//!
//! Backends operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`
//! and accumulate in `f32` regardless of the incoming dtype.

pub mod config;
pub mod errors;
pub mod kernel;

pub use config::{AttentionConfig, KernelToggles, OperatorConfig, QkOutputMode};
pub use errors::AttentionError;
pub use kernel::{AttentionKernel, AttentionProblem, DeviceKind, KernelOutput, ProblemDims};
