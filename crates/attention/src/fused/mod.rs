//! In-crate fused attention kernels.
//!
//! Vendor-specific fused self, fused cross and flash kernels are supplied by
//! callers through [`KernelRegistry::register`](crate::selector::KernelRegistry::register).

pub mod memory_efficient;

pub use memory_efficient::{MemoryEfficientAttention, DEFAULT_BLOCK_SIZE};
