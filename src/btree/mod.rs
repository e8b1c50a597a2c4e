//! # B+Tree Index Module
//!
//! Everything that makes up the MultiIndex engine: the key codec, the byte
//! layouts of node and leaf blocks, the per-index free lists, the tree
//! algorithms, and the public [`MultiIndex`] container.
//!
//! ## Layering
//!
//! ```text
//! multi_index   public API, active-index scoping, metadata caching
//!      |
//!    tree       descent, insert/delete propagation, cursor moves
//!      |
//!  freelist     block I/O with checksum sealing, batch allocation
//!      |
//!  node/keys    byte-level block accessors, typed key comparison
//! ```
//!
//! The `tree` layer operates on a borrowed view of one index (device +
//! metadata + cursor); the container constructs that view per call, scoped
//! to whichever index is active.
//!
//! ## Module Organization
//!
//! - [`keys`]: `KeyType`, `IndexAttrs`, comparison, EOF sentinel patterns
//! - `node`: `NodeBuf` / `LeafBuf` block buffers (1-indexed items)
//! - `cursor`: per-index position state with BOF/EOF flags
//! - `freelist`: batch pre-creation and allocate/free of blocks
//! - `tree`: the B+tree engine proper
//! - `multi_index`: the [`MultiIndex`] container

mod cursor;
mod freelist;
pub mod keys;
mod multi_index;
mod node;
mod tree;

pub use keys::{IndexAttrs, KeyType};
pub use multi_index::MultiIndex;
