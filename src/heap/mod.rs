//! # Heap Module
//!
//! The [`HeapFile`] engine: variable-length record space with first-fit
//! reuse of freed extents, tracked through a linked chain of fixed-size
//! holes tables. Pairs with the MultiIndex engine - the heap stores the
//! records, the index stores `key -> heap offset`.
//!
//! - `holes`: holes-table block accessors
//! - `heap_file`: the public allocator

mod heap_file;
mod holes;

pub use heap_file::HeapFile;
