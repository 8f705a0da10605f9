//! Past/present key/value cache management.
//!
//! Four states are handled per invocation: no cache, a static past reused as
//! the whole key/value (cross attention), incremental append by
//! concatenation, and incremental append into a caller-owned buffer shared by
//! past and present. Beam-search indirection is read through: it reorders the
//! prefix the kernel attends over and leaves stored history untouched.

pub mod arena;
pub mod indirection;
pub mod manager;

pub use arena::KvArena;
pub use indirection::{gather_beams, CacheIndirection};
pub use manager::{CacheManager, KvCacheState};
