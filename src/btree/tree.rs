//! # B+Tree Engine
//!
//! The core algorithm of the index: path descent with an explicit stack,
//! binary search within nodes, insert with overflow handling, delete with
//! underflow handling, and the doubly linked leaf chain that makes range
//! scans a pointer walk.
//!
//! ## Shape of the Tree
//!
//! Internal nodes hold up to `max_items` pairs of `(separator key, child)`,
//! 1-indexed. For every item `(K_i, C_i)`, all keys in the subtree under
//! `C_i` compare `<= K_i`, so a descent picks the first item whose key is
//! `>=` the probe. Leaves hold exactly one `(key, data_pos)` pair each and
//! are chained in key order.
//!
//! The rightmost leaf is the **EOF sentinel**: its key is the per-type
//! maximum, its data position is nil, and it is installed at init and never
//! removed. Because the sentinel key is strictly greater than any ordinary
//! key, every descent terminates without an end-of-node special case; this
//! simplification is load-bearing throughout the module. Internal levels
//! mirror it - the rightmost slot of the rightmost node at every level
//! carries the sentinel key.
//!
//! ## Insert
//!
//! ```text
//! 1. find_path() -> stack of (node, item) frames + the leaf that will
//!    follow the new key in chain order
//! 2. splice a fresh leaf into the chain just before that leaf
//! 3. exact match at the bottom frame?
//!      UNIQUE       -> undo the splice, return false
//!      duplicates   -> repoint the bottom slot at the new leaf (newest
//!                      copy wins), done
//! 4. otherwise propagate (key, new leaf) upward:
//!      node has room            -> shift in; report "last key changed"
//!                                  if it landed in the last slot
//!      right sibling has room   -> shove one item (or the new item)
//!                                  rightward, then insert
//!      otherwise                -> split right, push two separators up
//! 5. a split of the root grows the tree by one level
//! ```
//!
//! ## Delete
//!
//! `delete_all` removes the single bottom-level separator for the key, then
//! walks the leaf chain freeing every leaf that compares equal (duplicates
//! share one bottom slot). Removing a separator may underflow its node:
//! merge into the right sibling when both fit in half a node, otherwise
//! borrow from the right sibling's head when it has enough to spare. A node
//! emptied entirely is unlinked from its level chain and freed.
//!
//! A "last key changed" outcome - from a tail insert, a borrow, or deleting
//! the last slot - rewrites the parent separator on the saved path, and
//! keeps walking up while the rewritten slot was that parent's own last
//! slot.
//!
//! ## Root Collapse
//!
//! During descent, a root carrying a single item is eliminated: its only
//! child becomes the new root and the height drops by one. Deletions never
//! shrink the root eagerly; the next descent tidies it.
//!
//! ## Cursor
//!
//! Every positioning operation lands the cursor on a leaf and caches its
//! chain neighbours, so `next`/`prev` are one leaf read each. BOF/EOF
//! semantics live in [`Cursor`](super::cursor::Cursor).

use std::cmp::Ordering;

use eyre::Result;
use smallvec::SmallVec;

use crate::config::{MIN_MAX_ITEMS, NIL_POS};
use crate::error::ErrorKind;
use crate::storage::{BlockDevice, IndexInfo};

use super::cursor::Cursor;
use super::keys::{IndexAttrs, KeyType};
use super::node::{LeafBuf, NodeBuf};

/// One step of a root-to-bottom descent: the node visited and the 1-based
/// item chosen in it (0 at the bottom frame means "no exact key match").
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathFrame {
    pub node_pos: i64,
    pub child_no: u16,
}

type PathStack = SmallVec<[PathFrame; 8]>;

struct DescentPath {
    stack: PathStack,
    bottom: PathFrame,
    leaf: i64,
}

enum InsertOutcome {
    Done,
    LastChanged(Vec<u8>),
    Split {
        parent_key: Vec<u8>,
        extra_key: Vec<u8>,
        extra_child: i64,
    },
}

enum RemoveOutcome {
    Done,
    LastChanged(Vec<u8>),
    Removed,
}

/// Finds the least item `i` in `[1, num_used]` whose key is `>=` the probe,
/// and whether it is an exact match; `num_used + 1` when the probe exceeds
/// every key. This is the hot loop of every descent.
pub(crate) fn search_node(kt: KeyType, node: &NodeBuf, key: &[u8]) -> (u16, bool) {
    let n = node.num_used();
    if n == 0 {
        return (1, false);
    }

    let mut lo: u16 = 1;
    let mut hi: u16 = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if kt.compare(key, node.key(mid)) == Ordering::Greater {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    match kt.compare(key, node.key(lo)) {
        Ordering::Less => (lo, false),
        Ordering::Equal => (lo, true),
        Ordering::Greater => (n + 1, false),
    }
}

/// A borrowed view of one index: the shared device plus that index's
/// metadata and cursor. All engine operations run through this.
pub(crate) struct Tree<'a> {
    pub(crate) dev: &'a BlockDevice,
    pub(crate) info: &'a mut IndexInfo,
    pub(crate) cursor: &'a mut Cursor,
    pub(crate) kt: KeyType,
}

impl<'a> Tree<'a> {
    pub fn new(
        dev: &'a BlockDevice,
        info: &'a mut IndexInfo,
        cursor: &'a mut Cursor,
        kt: KeyType,
    ) -> Self {
        Self {
            dev,
            info,
            cursor,
            kt,
        }
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.kt.compare(a, b)
    }

    fn attrs(&self) -> IndexAttrs {
        IndexAttrs::from_bits(self.info.attrs())
    }

    pub fn is_unique(&self) -> bool {
        self.attrs().contains(IndexAttrs::UNIQUE)
    }

    pub fn can_delete(&self) -> bool {
        self.attrs().contains(IndexAttrs::ALLOW_DELETE)
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Sets up this index's metadata, pre-creates the first block batches,
    /// and installs the EOF sentinel leaf under a one-item root.
    pub fn init(
        &mut self,
        key_type: KeyType,
        key_size: u16,
        attrs: IndexAttrs,
        max_items: u16,
        node_batch: i64,
        leaf_batch: i64,
    ) -> Result<()> {
        let width_ok = match key_type {
            KeyType::Int16 => key_size == 2,
            KeyType::Int32 => key_size == 4,
            KeyType::Bool | KeyType::Byte => key_size == 1,
            _ => key_size > 0,
        };
        if !width_ok {
            return invalid(format!(
                "key size {} does not fit key type {:?}",
                key_size, key_type
            ));
        }
        if max_items < MIN_MAX_ITEMS {
            return invalid(format!(
                "fan-out {} below the minimum of {}",
                max_items, MIN_MAX_ITEMS
            ));
        }
        if node_batch < 1 || leaf_batch < 1 {
            return invalid(format!(
                "pre-allocation batches must be positive (got {}, {})",
                node_batch, leaf_batch
            ));
        }

        self.kt = key_type;
        self.info.set_attrs(attrs.bits());
        self.info.set_key_type_raw(key_type.as_raw());
        self.info.set_key_size(key_size);
        self.info.set_max_items(max_items);
        self.info.set_node_batch(node_batch);
        self.info.set_leaf_batch(leaf_batch);
        self.info.set_free_node(NIL_POS);
        self.info.set_free_leaf(NIL_POS);
        self.info.set_height(0);
        self.info.set_root(NIL_POS);
        self.info.set_first_leaf(NIL_POS);
        self.info.set_last_leaf(NIL_POS);

        self.create_nodes(node_batch)?;
        self.create_leaves(leaf_batch)?;
        self.create_first_node()?;
        self.info.set_height(1);
        self.cursor.reset();
        Ok(())
    }

    fn create_first_node(&mut self) -> Result<()> {
        let mut leaf = self.new_leaf();
        self.kt.fill_eof_key(leaf.key_mut());
        leaf.set_data_pos(NIL_POS);
        let leaf_pos = self.write_new_leaf(&mut leaf)?;
        self.info.set_first_leaf(leaf_pos);
        self.info.set_last_leaf(leaf_pos);

        let sentinel_key = leaf.key().to_vec();
        let mut root = self.new_node();
        root.insert_item(1, &sentinel_key, leaf_pos);
        let root_pos = self.write_new_node(&mut root)?;
        self.info.set_root(root_pos);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// Walks from the root to the bottom node level, recording the chosen
    /// item at each step. Along the way, a root holding a single item is
    /// eliminated (its child becomes the root, the height drops).
    ///
    /// On success the bottom frame's `child_no` is the exact-match item or
    /// 0, and `leaf` is the leaf the probe key precedes (or equals).
    fn find_path(&mut self, key: &[u8]) -> Result<Option<DescentPath>> {
        let mut node_pos = self.info.root();
        let mut remain = self.info.height();
        if node_pos == NIL_POS || remain == 0 {
            return Ok(None);
        }

        let mut stack = PathStack::new();
        let mut bottom: Option<PathFrame> = None;
        let mut leaf = NIL_POS;
        let mut past_top = false;

        while node_pos != NIL_POS {
            let node = self.read_node(node_pos)?;
            let n = node.num_used();

            if past_top || n > 1 {
                past_top = true;
                let (item_no, exact) = search_node(self.kt, &node, key);

                if item_no <= n {
                    remain -= 1;
                    if remain == 0 {
                        bottom = Some(PathFrame {
                            node_pos,
                            child_no: if exact { item_no } else { 0 },
                        });
                        leaf = node.child(item_no);
                        node_pos = NIL_POS;
                    } else {
                        stack.push(PathFrame {
                            node_pos,
                            child_no: item_no,
                        });
                        node_pos = node.child(item_no);
                    }
                } else {
                    // probe above the sentinel: impossible on an intact tree
                    stack.clear();
                    bottom = None;
                    node_pos = NIL_POS;
                }
            } else if self.info.height() > 1 {
                // single-item root: its child takes over as root
                let child = node.child(1);
                self.free_node(node_pos)?;
                self.info.set_root(child);
                self.info.dec_height();
                remain -= 1;
                node_pos = child;
            } else {
                remain -= 1;
                bottom = Some(PathFrame {
                    node_pos,
                    child_no: 0,
                });
                leaf = node.child(1);
                node_pos = NIL_POS;
            }
        }

        match bottom {
            Some(b) if remain == 0 => Ok(Some(DescentPath {
                stack,
                bottom: b,
                leaf,
            })),
            _ => Ok(None),
        }
    }

    /// Plain descent to the leaf a key maps to, without a path stack and
    /// without touching the tree. Returns `(exact_match, leaf_pos)`.
    fn find_leaf(&mut self, key: &[u8]) -> Result<(bool, i64)> {
        let mut level = self.info.height();
        if level < 1 {
            return Ok((false, NIL_POS));
        }
        let mut node_pos = self.info.root();

        while level > 1 && node_pos != NIL_POS {
            let node = self.read_node(node_pos)?;
            let (item_no, _) = search_node(self.kt, &node, key);
            if item_no <= node.num_used() {
                node_pos = node.child(item_no);
                level -= 1;
            } else {
                node_pos = NIL_POS;
            }
        }

        if node_pos == NIL_POS {
            return Ok((false, NIL_POS));
        }

        let node = self.read_node(node_pos)?;
        let (item_no, exact) = search_node(self.kt, &node, key);
        if item_no <= node.num_used() {
            Ok((exact, node.child(item_no)))
        } else {
            Ok((false, NIL_POS))
        }
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Inserts `(key, data_pos)`. Returns `false` without touching the tree
    /// when the key already exists in a UNIQUE index (or when the index is
    /// not initialized).
    pub fn insert(&mut self, key: &[u8], data_pos: i64) -> Result<bool> {
        let Some(path) = self.find_path(key)? else {
            return Ok(false);
        };
        let DescentPath {
            mut stack,
            bottom,
            leaf: next_leaf_pos,
        } = path;

        // splice a fresh leaf into the chain just before the leaf the new
        // key precedes (or equals)
        let leaf_pos = self.allocate_leaf()?;
        let mut new_leaf = self.new_leaf();
        new_leaf.set_next_leaf(next_leaf_pos);

        let mut after = self.read_leaf(next_leaf_pos)?;
        let prev_leaf_pos = after.prev_leaf();
        new_leaf.set_prev_leaf(prev_leaf_pos);
        after.set_prev_leaf(leaf_pos);
        self.write_leaf(&mut after, next_leaf_pos)?;

        if prev_leaf_pos != NIL_POS {
            let mut before = self.read_leaf(prev_leaf_pos)?;
            before.set_next_leaf(leaf_pos);
            self.write_leaf(&mut before, prev_leaf_pos)?;
        } else {
            self.info.set_first_leaf(leaf_pos);
        }

        new_leaf.set_key(key);
        new_leaf.set_data_pos(data_pos);
        self.write_leaf(&mut new_leaf, leaf_pos)?;

        if bottom.child_no > 0 {
            // descent saw an exact key match
            if self.is_unique() {
                self.unsplice_leaf(leaf_pos, prev_leaf_pos, next_leaf_pos)?;
                return Ok(false);
            }
            // duplicates: the bottom slot always points at the newest copy
            let mut node = self.read_node(bottom.node_pos)?;
            node.set_child(bottom.child_no, leaf_pos);
            self.write_node(&mut node, bottom.node_pos)?;
            self.set_position_from_leaf(leaf_pos, &new_leaf);
            return Ok(true);
        }

        self.set_position_from_leaf(leaf_pos, &new_leaf);

        // a genuinely new key: place its separator, propagating splits
        let mut node_pos = bottom.node_pos;
        let mut new_key = key.to_vec();
        let mut new_child = leaf_pos;
        let mut changed: Option<(u16, Vec<u8>)> = None;

        loop {
            match self.insert_into_node(node_pos, &new_key, new_child, changed.take())? {
                InsertOutcome::Done => return Ok(true),
                InsertOutcome::LastChanged(parent_key) => {
                    self.rewrite_separators(&mut stack, &parent_key)?;
                    return Ok(true);
                }
                InsertOutcome::Split {
                    parent_key,
                    extra_key,
                    extra_child,
                } => {
                    if let Some(frame) = stack.pop() {
                        changed = Some((frame.child_no, parent_key));
                        new_key = extra_key;
                        new_child = extra_child;
                        node_pos = frame.node_pos;
                    } else {
                        // the root itself split: grow the tree by one level
                        let mut root = self.new_node();
                        root.insert_item(1, &parent_key, node_pos);
                        root.insert_item(2, &extra_key, extra_child);
                        let root_pos = self.write_new_node(&mut root)?;
                        self.info.set_root(root_pos);
                        self.info.inc_height();
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Reverses the chain splice done at the top of [`Tree::insert`].
    fn unsplice_leaf(&mut self, leaf_pos: i64, prev_pos: i64, next_pos: i64) -> Result<()> {
        let mut after = self.read_leaf(next_pos)?;
        after.set_prev_leaf(prev_pos);
        self.write_leaf(&mut after, next_pos)?;

        if prev_pos != NIL_POS {
            let mut before = self.read_leaf(prev_pos)?;
            before.set_next_leaf(next_pos);
            self.write_leaf(&mut before, prev_pos)?;
        } else {
            self.info.set_first_leaf(next_pos);
        }

        self.free_leaf(leaf_pos)
    }

    /// Places `(new_key, new_child)` into the node at `node_pos`, applying
    /// a pending separator rewrite first. Reports how the parent must
    /// react: nothing, a changed last key, or a split.
    fn insert_into_node(
        &mut self,
        node_pos: i64,
        new_key: &[u8],
        new_child: i64,
        changed: Option<(u16, Vec<u8>)>,
    ) -> Result<InsertOutcome> {
        let mut node = self.read_node(node_pos)?;

        if let Some((changed_no, changed_val)) = changed {
            node.set_key(changed_no, &changed_val);
        }

        let n = node.num_used();
        let (item_no, exact) = search_node(self.kt, &node, new_key);

        if exact {
            node.set_child(item_no, new_child);
            self.write_node(&mut node, node_pos)?;
            return Ok(InsertOutcome::Done);
        }

        let max = self.info.max_items();
        if n < max {
            node.insert_item(item_no, new_key, new_child);
            self.write_node(&mut node, node_pos)?;
            return Ok(if item_no <= n {
                InsertOutcome::Done
            } else {
                InsertOutcome::LastChanged(new_key.to_vec())
            });
        }

        // full: prefer shoving into the right sibling over splitting
        let next_pos = node.next_node();
        if next_pos != NIL_POS {
            let mut next = self.read_node(next_pos)?;
            if next.num_used() < max {
                if item_no <= n {
                    next.insert_item(1, node.key(n), node.child(n));
                    node.delete_item(n);
                    node.insert_item(item_no, new_key, new_child);
                } else {
                    next.insert_item(1, new_key, new_child);
                }

                if self.can_delete() {
                    let to_move = (node.num_used() - next.num_used()) / 2;
                    for _ in 0..to_move {
                        let tail = node.num_used();
                        next.insert_item(1, node.key(tail), node.child(tail));
                        node.delete_item(tail);
                    }
                }

                let parent_key = node.last_key().to_vec();
                self.write_node(&mut node, node_pos)?;
                self.write_node(&mut next, next_pos)?;
                return Ok(InsertOutcome::LastChanged(parent_key));
            }
        }

        // split: new right sibling takes the tail
        let mut right = self.new_node();
        if item_no <= n {
            right.insert_item(1, node.key(n), node.child(n));
            node.delete_item(n);
            node.insert_item(item_no, new_key, new_child);
        } else {
            right.insert_item(1, new_key, new_child);
        }

        if self.can_delete() {
            let to_move = (node.num_used() - 1) / 2;
            for _ in 0..to_move {
                let tail = node.num_used();
                right.insert_item(1, node.key(tail), node.child(tail));
                node.delete_item(tail);
            }
        }

        right.set_next_node(next_pos);
        right.set_prev_node(node_pos);
        let right_pos = self.write_new_node(&mut right)?;
        node.set_next_node(right_pos);

        if next_pos != NIL_POS {
            let mut next = self.read_node(next_pos)?;
            next.set_prev_node(right_pos);
            self.write_node(&mut next, next_pos)?;
        }

        self.write_node(&mut node, node_pos)?;

        Ok(InsertOutcome::Split {
            parent_key: node.last_key().to_vec(),
            extra_key: right.last_key().to_vec(),
            extra_child: right_pos,
        })
    }

    /// Walks up the saved path rewriting each parent's chosen slot with
    /// `parent_key`, continuing while the rewritten slot was that parent's
    /// own last slot.
    fn rewrite_separators(&mut self, stack: &mut PathStack, parent_key: &[u8]) -> Result<()> {
        while let Some(frame) = stack.pop() {
            let mut node = self.read_node(frame.node_pos)?;
            node.set_key(frame.child_no, parent_key);
            self.write_node(&mut node, frame.node_pos)?;
            if frame.child_no != node.num_used() {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Find and navigation
    // ------------------------------------------------------------------

    /// Point lookup. Positions the cursor on the first leaf with the key
    /// and returns its data position; on a miss the cursor lands on the
    /// next larger leaf (or the sentinel) and the result is nil.
    pub fn find(&mut self, key: &[u8]) -> Result<i64> {
        let (exact, leaf_pos) = self.find_leaf(key)?;
        if exact {
            return self.load_leaf(leaf_pos, None);
        }
        if leaf_pos != NIL_POS {
            self.load_leaf(leaf_pos, None)?;
        }
        Ok(NIL_POS)
    }

    /// Reads the leaf at `pos`, repositions the cursor on it, optionally
    /// copies its key out, and returns its data position.
    fn load_leaf(&mut self, pos: i64, key_out: Option<&mut [u8]>) -> Result<i64> {
        if pos == NIL_POS {
            return Ok(NIL_POS);
        }
        let leaf = self.read_leaf(pos)?;
        self.set_position_from_leaf(pos, &leaf);
        if let Some(out) = key_out {
            out.copy_from_slice(leaf.key());
        }
        Ok(self.cursor.data_pos())
    }

    fn set_position_from_leaf(&mut self, pos: i64, leaf: &LeafBuf) {
        self.cursor.set(
            pos,
            leaf.next_leaf(),
            leaf.prev_leaf(),
            leaf.data_pos(),
            self.info.first_leaf(),
            self.info.last_leaf(),
        );
    }

    pub fn first(&mut self, key_out: Option<&mut [u8]>) -> Result<i64> {
        if self.info.first_leaf() != self.info.last_leaf() {
            self.load_leaf(self.info.first_leaf(), key_out)
        } else {
            Ok(NIL_POS)
        }
    }

    pub fn next(&mut self, key_out: Option<&mut [u8]>) -> Result<i64> {
        if !self.cursor.is_eof() && self.cursor.next() != NIL_POS {
            self.load_leaf(self.cursor.next(), key_out)
        } else {
            Ok(NIL_POS)
        }
    }

    pub fn prev(&mut self, key_out: Option<&mut [u8]>) -> Result<i64> {
        if !self.cursor.is_bof() && self.cursor.prev() != NIL_POS {
            self.load_leaf(self.cursor.prev(), key_out)
        } else {
            Ok(NIL_POS)
        }
    }

    pub fn current(&mut self, key_out: Option<&mut [u8]>) -> Result<i64> {
        self.load_leaf(self.cursor.current(), key_out)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Deletes every entry with `key`. Returns `false` when the key is not
    /// present.
    pub fn delete_all(&mut self, key: &[u8]) -> Result<bool> {
        let first_hit = self.remove_from_nodes(key)?;
        if first_hit == NIL_POS {
            return Ok(false);
        }

        // free the run of equal-keyed leaves starting at the hit
        let mut leaf = self.read_leaf(first_hit)?;
        let before_pos = leaf.prev_leaf();
        let mut pos = first_hit;
        loop {
            self.free_leaf(pos)?;
            pos = leaf.next_leaf();
            if pos == NIL_POS {
                self.dev.set_error(ErrorKind::Corruption);
                return Err(eyre::Report::new(ErrorKind::Corruption)
                    .wrap_err("leaf chain ended before the EOF sentinel"));
            }
            leaf = self.read_leaf(pos)?;
            if self.cmp(leaf.key(), key) != Ordering::Equal {
                break;
            }
        }

        // close the chain over the freed run
        leaf.set_prev_leaf(before_pos);
        self.write_leaf(&mut leaf, pos)?;
        if before_pos != NIL_POS {
            let mut before = self.read_leaf(before_pos)?;
            before.set_next_leaf(pos);
            self.write_leaf(&mut before, before_pos)?;
        } else {
            self.info.set_first_leaf(pos);
        }

        if pos != self.info.last_leaf() {
            self.load_leaf(pos, None)?;
        } else if before_pos != NIL_POS {
            self.load_leaf(before_pos, None)?;
        } else {
            self.cursor.reset();
        }

        Ok(true)
    }

    /// Removes the bottom-level separator for `key` and repairs the
    /// internal levels. Returns the leaf position the separator pointed at,
    /// or nil when the key has no exact match.
    fn remove_from_nodes(&mut self, key: &[u8]) -> Result<i64> {
        let Some(path) = self.find_path(key)? else {
            return Ok(NIL_POS);
        };
        let DescentPath {
            mut stack,
            bottom,
            leaf,
        } = path;

        if bottom.child_no == 0 {
            return Ok(NIL_POS);
        }

        let mut node_pos = bottom.node_pos;
        let mut remove_no = bottom.child_no;

        loop {
            match self.remove_from_node(node_pos, remove_no)? {
                RemoveOutcome::Done => return Ok(leaf),
                RemoveOutcome::LastChanged(parent_key) => {
                    self.rewrite_separators(&mut stack, &parent_key)?;
                    return Ok(leaf);
                }
                RemoveOutcome::Removed => {
                    // the node is gone: remove its separator from the parent
                    if let Some(frame) = stack.pop() {
                        node_pos = frame.node_pos;
                        remove_no = frame.child_no;
                    } else {
                        return Ok(leaf);
                    }
                }
            }
        }
    }

    /// Deletes item `remove_no` from the node at `node_pos` and rebalances:
    /// merge into the right sibling when both halves fit in `fan_out / 2`,
    /// otherwise borrow from its head when it has enough to spare.
    fn remove_from_node(&mut self, node_pos: i64, remove_no: u16) -> Result<RemoveOutcome> {
        let mut node = self.read_node(node_pos)?;
        let n = node.num_used();

        if remove_no < 1 || remove_no > n {
            return Ok(RemoveOutcome::Done);
        }

        node.delete_item(remove_no);
        let mut last_changed = remove_no == n;
        let n = n - 1;

        if n == 0 {
            // node emptied: unlink it from its level chain and free it
            let next_pos = node.next_node();
            let prev_pos = node.prev_node();

            if next_pos != NIL_POS {
                let mut next = self.read_node(next_pos)?;
                next.set_prev_node(prev_pos);
                self.write_node(&mut next, next_pos)?;
            }
            if prev_pos != NIL_POS {
                let mut prev = self.read_node(prev_pos)?;
                prev.set_next_node(next_pos);
                self.write_node(&mut prev, prev_pos)?;
            }

            self.free_node(node_pos)?;
            return Ok(RemoveOutcome::Removed);
        }

        let next_pos = node.next_node();
        if next_pos != NIL_POS {
            let mut next = self.read_node(next_pos)?;
            let next_n = next.num_used();

            if next_n + n <= self.info.max_items() / 2 {
                // both fit in half a node: merge into the sibling's front
                for i in 1..=n {
                    next.insert_item(i, node.key(i), node.child(i));
                }

                let prev_pos = node.prev_node();
                if prev_pos != NIL_POS {
                    let mut prev = self.read_node(prev_pos)?;
                    prev.set_next_node(next_pos);
                    self.write_node(&mut prev, prev_pos)?;
                }
                next.set_prev_node(prev_pos);
                self.write_node(&mut next, next_pos)?;
                self.free_node(node_pos)?;
                return Ok(RemoveOutcome::Removed);
            } else if next_n > n + 1 {
                // sibling has items to spare: borrow from its head
                let to_move = (next_n - n) / 2;
                for _ in 0..to_move {
                    let tail = node.num_used() + 1;
                    node.insert_item(tail, next.key(1), next.child(1));
                    next.delete_item(1);
                }
                last_changed = true;
                self.write_node(&mut next, next_pos)?;
                self.write_node(&mut node, node_pos)?;
            } else {
                self.write_node(&mut node, node_pos)?;
            }
        } else {
            self.write_node(&mut node, node_pos)?;
        }

        if last_changed {
            Ok(RemoveOutcome::LastChanged(node.last_key().to_vec()))
        } else {
            Ok(RemoveOutcome::Done)
        }
    }

    /// Rewrites the bottom-level child pointer for `key` to `new_leaf_pos`
    /// and returns the previous pointer. Used when deleting one duplicate
    /// out of a chain.
    fn relink_bottom_child(&mut self, key: &[u8], new_leaf_pos: i64) -> Result<i64> {
        let mut level = self.info.height();
        if level < 1 {
            return Ok(NIL_POS);
        }
        let mut node_pos = self.info.root();

        while level > 1 && node_pos != NIL_POS {
            let node = self.read_node(node_pos)?;
            let (item_no, _) = search_node(self.kt, &node, key);
            if item_no <= node.num_used() {
                node_pos = node.child(item_no);
                level -= 1;
            } else {
                node_pos = NIL_POS;
            }
        }

        if node_pos == NIL_POS {
            return Ok(NIL_POS);
        }

        let mut node = self.read_node(node_pos)?;
        let (item_no, exact) = search_node(self.kt, &node, key);
        if exact && item_no <= node.num_used() {
            let old = node.child(item_no);
            node.set_child(item_no, new_leaf_pos);
            self.write_node(&mut node, node_pos)?;
            Ok(old)
        } else {
            Ok(NIL_POS)
        }
    }

    /// Deletes the leaf under the cursor and returns its data position.
    /// Whether the internal levels change depends on whether the key also
    /// lives in the neighbouring leaves (duplicates).
    pub fn delete_current(&mut self) -> Result<i64> {
        let current = self.cursor.current();
        if current == NIL_POS || current == self.info.last_leaf() {
            return Ok(NIL_POS);
        }

        let deleted = self.read_leaf(current)?;
        let data_pos = deleted.data_pos();
        let prev_pos = self.cursor.prev();
        let next_pos = self.cursor.next();

        let mut prev_equal = false;
        let mut next_equal = false;

        if prev_pos != NIL_POS {
            let mut prev = self.read_leaf(prev_pos)?;
            prev.set_next_leaf(next_pos);
            self.write_leaf(&mut prev, prev_pos)?;
            prev_equal = self.cmp(prev.key(), deleted.key()) == Ordering::Equal;
        } else {
            self.info.set_first_leaf(next_pos);
        }

        if next_pos != NIL_POS {
            let mut next = self.read_leaf(next_pos)?;
            next.set_prev_leaf(prev_pos);
            self.write_leaf(&mut next, next_pos)?;
            next_equal = self.cmp(next.key(), deleted.key()) == Ordering::Equal;
        }

        self.free_leaf(current)?;

        if !prev_equal {
            if next_equal {
                // more duplicates follow: the bottom slot moves to the next
                self.relink_bottom_child(deleted.key(), next_pos)?;
            } else {
                // last copy of this key: drop its separator entirely
                self.remove_from_nodes(deleted.key())?;
            }
        }

        if next_pos != NIL_POS && next_pos != self.info.last_leaf() {
            self.load_leaf(next_pos, None)?;
        } else if prev_pos != NIL_POS {
            self.load_leaf(prev_pos, None)?;
        } else {
            self.cursor.reset();
        }

        Ok(data_pos)
    }
}

fn invalid<T>(message: String) -> Result<T> {
    Err(eyre::Report::new(ErrorKind::InvalidArgument).wrap_err(message))
}
