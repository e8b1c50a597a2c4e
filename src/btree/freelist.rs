//! # Block I/O and Free-List Allocation
//!
//! Node and leaf blocks are created lazily in batches and recycled through
//! per-index free lists; they are never physically removed from the file.
//!
//! ## Batch Pre-Creation
//!
//! When a free list runs dry, a batch of zeroed blocks is appended at
//! end-of-file, each threaded to the one after it through its own `next_*`
//! header field, with the last block pointing at the previous list head.
//! The head then moves to the first appended block. Batching amortizes file
//! extension; threading the list through the blocks themselves avoids a
//! separate allocation bitmap.
//!
//! ## Allocate / Free
//!
//! ```text
//! allocate:  head -> read head block -> head = block.next -> return old head
//! free(p):   zero p, p.next = head, write p, head = p
//! ```
//!
//! The list terminator is nil (-1). Every block on the list is sealed like
//! any other block, so a corrupted free chain is caught on allocation.
//!
//! ## Checksum Discipline
//!
//! All reads verify the block XOR and latch
//! [`Corruption`](crate::error::ErrorKind::Corruption) on the device when it
//! fails; all writes seal the block first. This module is the only path by
//! which node and leaf blocks move between memory and disk.

use eyre::Result;
use tracing::warn;

use crate::config::NIL_POS;
use crate::error::ErrorKind;
use crate::storage::{seal_block, verify_block};

use super::node::{LeafBuf, NodeBuf};
use super::tree::Tree;

impl Tree<'_> {
    pub(crate) fn node_size(&self) -> usize {
        NodeBuf::block_size(self.info.key_size(), self.info.max_items())
    }

    pub(crate) fn leaf_size(&self) -> usize {
        LeafBuf::block_size(self.info.key_size())
    }

    pub(crate) fn new_node(&self) -> NodeBuf {
        NodeBuf::new(self.info.key_size(), self.info.max_items())
    }

    pub(crate) fn new_leaf(&self) -> LeafBuf {
        LeafBuf::new(self.info.key_size())
    }

    fn corrupt<T>(&self, what: &str, pos: i64) -> Result<T> {
        self.dev.set_error(ErrorKind::Corruption);
        warn!(pos, what, "index block failed verification");
        Err(eyre::Report::new(ErrorKind::Corruption)
            .wrap_err(format!("{} at position {}", what, pos)))
    }

    pub(crate) fn read_node(&self, pos: i64) -> Result<NodeBuf> {
        if pos < 0 {
            return self.corrupt("nil node position", pos);
        }
        let mut node = self.new_node();
        let want = node.as_bytes().len();
        let got = self.dev.read_at(node.as_bytes_mut(), pos as u64)?;
        if got != want {
            return self.corrupt("truncated node block", pos);
        }
        if !verify_block(node.as_bytes()) {
            return self.corrupt("node checksum mismatch", pos);
        }
        Ok(node)
    }

    pub(crate) fn write_node(&self, node: &mut NodeBuf, pos: i64) -> Result<()> {
        debug_assert!(pos >= 0);
        seal_block(node.as_bytes_mut());
        self.dev.write_at(node.as_bytes(), pos as u64)
    }

    /// Allocates a block from the free list and writes `node` into it.
    pub(crate) fn write_new_node(&mut self, node: &mut NodeBuf) -> Result<i64> {
        let pos = self.allocate_node()?;
        self.write_node(node, pos)?;
        Ok(pos)
    }

    pub(crate) fn read_leaf(&self, pos: i64) -> Result<LeafBuf> {
        if pos < 0 {
            return self.corrupt("nil leaf position", pos);
        }
        let mut leaf = self.new_leaf();
        let want = leaf.as_bytes().len();
        let got = self.dev.read_at(leaf.as_bytes_mut(), pos as u64)?;
        if got != want {
            return self.corrupt("truncated leaf block", pos);
        }
        if !verify_block(leaf.as_bytes()) {
            return self.corrupt("leaf checksum mismatch", pos);
        }
        Ok(leaf)
    }

    pub(crate) fn write_leaf(&self, leaf: &mut LeafBuf, pos: i64) -> Result<()> {
        debug_assert!(pos >= 0);
        seal_block(leaf.as_bytes_mut());
        self.dev.write_at(leaf.as_bytes(), pos as u64)
    }

    /// Allocates a block from the free list and writes `leaf` into it.
    pub(crate) fn write_new_leaf(&mut self, leaf: &mut LeafBuf) -> Result<i64> {
        let pos = self.allocate_leaf()?;
        self.write_leaf(leaf, pos)?;
        Ok(pos)
    }

    /// Appends `count` empty node blocks at end-of-file, threads them into a
    /// chain ending at the current free head, and installs the new head.
    pub(crate) fn create_nodes(&mut self, count: i64) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }

        let block_size = self.node_size() as i64;
        let base = self.dev.size()? as i64;
        let mut node = self.new_node();

        for i in 0..count {
            let next = if i + 1 < count {
                base + (i + 1) * block_size
            } else {
                self.info.free_node()
            };
            node.set_next_node(next);
            self.write_node(&mut node, base + i * block_size)?;
        }

        self.info.set_free_node(base);
        Ok(())
    }

    /// Leaf-side twin of [`Tree::create_nodes`].
    pub(crate) fn create_leaves(&mut self, count: i64) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }

        let block_size = self.leaf_size() as i64;
        let base = self.dev.size()? as i64;
        let mut leaf = self.new_leaf();

        for i in 0..count {
            let next = if i + 1 < count {
                base + (i + 1) * block_size
            } else {
                self.info.free_leaf()
            };
            leaf.set_next_leaf(next);
            self.write_leaf(&mut leaf, base + i * block_size)?;
        }

        self.info.set_free_leaf(base);
        Ok(())
    }

    pub(crate) fn allocate_node(&mut self) -> Result<i64> {
        let mut pos = self.info.free_node();
        if pos == NIL_POS {
            self.create_nodes(self.info.node_batch())?;
            pos = self.info.free_node();
        }
        if pos == NIL_POS {
            return Err(eyre::Report::new(ErrorKind::Init)
                .wrap_err("node free list is empty and the batch size is zero"));
        }

        let node = self.read_node(pos)?;
        self.info.set_free_node(node.next_node());
        Ok(pos)
    }

    pub(crate) fn allocate_leaf(&mut self) -> Result<i64> {
        let mut pos = self.info.free_leaf();
        if pos == NIL_POS {
            self.create_leaves(self.info.leaf_batch())?;
            pos = self.info.free_leaf();
        }
        if pos == NIL_POS {
            return Err(eyre::Report::new(ErrorKind::Init)
                .wrap_err("leaf free list is empty and the batch size is zero"));
        }

        let leaf = self.read_leaf(pos)?;
        self.info.set_free_leaf(leaf.next_leaf());
        Ok(pos)
    }

    pub(crate) fn free_node(&mut self, pos: i64) -> Result<()> {
        let mut node = self.new_node();
        node.set_next_node(self.info.free_node());
        self.write_node(&mut node, pos)?;
        self.info.set_free_node(pos);
        Ok(())
    }

    pub(crate) fn free_leaf(&mut self, pos: i64) -> Result<()> {
        let mut leaf = self.new_leaf();
        leaf.set_next_leaf(self.info.free_leaf());
        self.write_leaf(&mut leaf, pos)?;
        self.info.set_free_leaf(pos);
        Ok(())
    }
}
