//! # Configuration Module
//!
//! Centralizes the crate's tunable constants. Interdependent values are
//! co-located and documented in [`constants`] so a change in one place
//! cannot silently invalidate another.

pub mod constants;
pub use constants::*;
