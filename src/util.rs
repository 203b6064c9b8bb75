//! Shared utility modules used across the merge and point-tree code.

pub mod bit_util;
pub mod bits;
pub mod latch;
pub mod numeric;
pub mod packed;
