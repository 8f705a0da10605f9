//! Portable reference attention.
//!
//! Favours clarity over speed and serves as the baseline every other kernel is
//! checked against.

pub mod unfused;

pub use unfused::UnfusedAttention;
