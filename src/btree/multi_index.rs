//! # MultiIndex Container
//!
//! One file, N independent B+tree indexes. The container owns the shared
//! block device, an in-memory cached copy of the file header and every
//! index's metadata, and one cursor per index. All key operations are
//! scoped to the **active index**, selected with
//! [`MultiIndex::set_active_index`] (1-based on the public surface,
//! 0-based internally).
//!
//! ## File Layout
//!
//! ```text
//! offset 0:  FileHeader { u8 chk; u16 num_indexes }
//! offset 3:  IndexInfo[num_indexes]   (67 bytes each)
//! then:      node and leaf blocks, appended in batches
//! ```
//!
//! The index count is fixed at creation. An index slot is inert until
//! [`MultiIndex::init_index`] gives it a key type and its first blocks; key
//! operations on an uninitialized slot report "nothing there" (nil /
//! `false`) rather than failing.
//!
//! ## Caching and Flushing
//!
//! Metadata mutates in memory as operations run; it reaches disk through
//! [`MultiIndex::flush_index`] (header), [`MultiIndex::flush_file`] (the
//! whole `IndexInfo` array), `init_index` (that index's record), and
//! unconditionally when the container drops. The drop flush swallows and
//! logs errors - destructors must not fail.
//!
//! ## Error Surface
//!
//! Missing keys, duplicate inserts under UNIQUE, and empty-index
//! navigation are value results ([`NIL_POS`] / `false`). Real failures -
//! I/O errors, checksum mismatches - come back as `eyre` errors carrying an
//! [`ErrorKind`](crate::error::ErrorKind) and latch the device's last-error
//! field; once latched, key operations short-circuit to nil/`false` until
//! [`MultiIndex::clear_error`].
//!
//! ## Concurrency
//!
//! Every public method locks the container's re-entrant mutex, so each
//! call is atomic with respect to other calls on the same object. Two
//! `MultiIndex` objects opened on the same path are *not* coordinated.

use std::cell::RefCell;
use std::path::Path;

use eyre::Result;
use parking_lot::ReentrantMutex;
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::config::NIL_POS;
use crate::error::ErrorKind;
use crate::storage::{BlockDevice, FileHeader, IndexInfo, FILE_HEADER_SIZE, INDEX_INFO_SIZE};

use super::cursor::Cursor;
use super::keys::{IndexAttrs, KeyType};
use super::tree::Tree;

struct IndexSet {
    header: FileHeader,
    infos: Vec<IndexInfo>,
    cursors: Vec<Cursor>,
    current: usize,
}

/// A file of persistent B+tree indexes mapping fixed-size keys to opaque
/// 64-bit data positions.
pub struct MultiIndex {
    device: BlockDevice,
    state: ReentrantMutex<RefCell<IndexSet>>,
}

impl MultiIndex {
    /// Creates a new index file with `num_indexes` (initially inert) index
    /// slots.
    pub fn create<P: AsRef<Path>>(path: P, num_indexes: u16) -> Result<Self> {
        if num_indexes == 0 {
            return Err(eyre::Report::new(ErrorKind::InvalidArgument)
                .wrap_err("an index file needs at least one index"));
        }

        let device = BlockDevice::create(&path)?;
        let mut header = FileHeader::new(num_indexes);
        let mut infos = vec![IndexInfo::new_uninit(); num_indexes as usize];

        write_header(&device, &mut header)?;
        for (i, info) in infos.iter_mut().enumerate() {
            write_info(&device, info, i)?;
        }

        debug!(
            path = %path.as_ref().display(),
            num_indexes, "created index file"
        );

        Ok(Self {
            device,
            state: ReentrantMutex::new(RefCell::new(IndexSet {
                header,
                infos,
                cursors: vec![Cursor::new(); num_indexes as usize],
                current: 0,
            })),
        })
    }

    /// Opens an existing index file, verifying the header and every index
    /// record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let device = BlockDevice::open(&path)?;

        let mut header_bytes = [0u8; FILE_HEADER_SIZE];
        let got = device.read_at(&mut header_bytes, 0)?;
        if got != FILE_HEADER_SIZE {
            device.set_error(ErrorKind::Corruption);
            return Err(eyre::Report::new(ErrorKind::Corruption).wrap_err("truncated file header"));
        }
        let header = FileHeader::from_bytes(&header_bytes)?;
        if !header.verify() {
            device.set_error(ErrorKind::Corruption);
            return Err(
                eyre::Report::new(ErrorKind::Corruption).wrap_err("file header checksum mismatch")
            );
        }

        let num_indexes = header.num_indexes() as usize;
        if num_indexes == 0 {
            device.set_error(ErrorKind::Corruption);
            return Err(
                eyre::Report::new(ErrorKind::Corruption).wrap_err("file header lists no indexes")
            );
        }
        let mut infos = Vec::with_capacity(num_indexes);
        for i in 0..num_indexes {
            let mut info_bytes = [0u8; INDEX_INFO_SIZE];
            let pos = (FILE_HEADER_SIZE + i * INDEX_INFO_SIZE) as u64;
            let got = device.read_at(&mut info_bytes, pos)?;
            if got != INDEX_INFO_SIZE {
                device.set_error(ErrorKind::Corruption);
                return Err(eyre::Report::new(ErrorKind::Corruption)
                    .wrap_err(format!("truncated IndexInfo record {}", i + 1)));
            }
            let info = IndexInfo::from_bytes(&info_bytes)?;
            if !info.verify() {
                device.set_error(ErrorKind::Corruption);
                return Err(eyre::Report::new(ErrorKind::Corruption)
                    .wrap_err(format!("IndexInfo record {} checksum mismatch", i + 1)));
            }
            infos.push(info);
        }

        debug!(path = %path.as_ref().display(), num_indexes, "opened index file");

        Ok(Self {
            device,
            state: ReentrantMutex::new(RefCell::new(IndexSet {
                header,
                infos,
                cursors: vec![Cursor::new(); num_indexes],
                current: 0,
            })),
        })
    }

    // ------------------------------------------------------------------
    // Index configuration
    // ------------------------------------------------------------------

    /// Initializes the active index: fixes its key type, key size,
    /// attributes and fan-out, pre-creates its first block batches, and
    /// installs the EOF sentinel. Must be called once per index before any
    /// key operation.
    pub fn init_index(
        &self,
        key_type: KeyType,
        key_size: u16,
        attrs: IndexAttrs,
        max_items: u16,
        node_batch: i64,
        leaf_batch: i64,
    ) -> Result<()> {
        let guard = self.state.lock();
        let mut set = guard.borrow_mut();
        let set = &mut *set;

        if let Some(kind) = self.device.last_error() {
            return Err(eyre::Report::new(kind).wrap_err("device has a latched error"));
        }

        let current = set.current;
        let mut tree = Tree::new(
            &self.device,
            &mut set.infos[current],
            &mut set.cursors[current],
            key_type,
        );
        tree.init(key_type, key_size, attrs, max_items, node_batch, leaf_batch)?;

        write_info(&self.device, &mut set.infos[current], current)
    }

    /// Selects the index subsequent operations apply to, 1-based. An
    /// out-of-range number falls back to index 1.
    pub fn set_active_index(&self, index_no: u16) {
        let guard = self.state.lock();
        let mut set = guard.borrow_mut();
        let num = set.header.num_indexes();
        set.current = if index_no >= 1 && index_no <= num {
            index_no as usize - 1
        } else {
            0
        };
    }

    /// The active index number, 1-based.
    pub fn active_index(&self) -> u16 {
        let guard = self.state.lock();
        let set = guard.borrow();
        set.current as u16 + 1
    }

    /// Number of indexes in the file (fixed at creation).
    pub fn num_indexes(&self) -> u16 {
        let guard = self.state.lock();
        let set = guard.borrow();
        set.header.num_indexes()
    }

    /// Key type of the active index; `None` before `init_index`.
    pub fn key_type(&self) -> Option<KeyType> {
        let guard = self.state.lock();
        let set = guard.borrow();
        KeyType::from_raw(set.infos[set.current].key_type_raw())
    }

    /// Key size in bytes of the active index (0 before `init_index`).
    pub fn key_size(&self) -> u16 {
        let guard = self.state.lock();
        let set = guard.borrow();
        set.infos[set.current].key_size()
    }

    /// Whether the active index rejects duplicate keys.
    pub fn is_unique(&self) -> bool {
        let guard = self.state.lock();
        let set = guard.borrow();
        IndexAttrs::from_bits(set.infos[set.current].attrs()).contains(IndexAttrs::UNIQUE)
    }

    /// Whether the active index balances nodes on underflow.
    pub fn can_delete(&self) -> bool {
        let guard = self.state.lock();
        let set = guard.borrow();
        IndexAttrs::from_bits(set.infos[set.current].attrs()).contains(IndexAttrs::ALLOW_DELETE)
    }

    // ------------------------------------------------------------------
    // Key operations
    // ------------------------------------------------------------------

    /// Inserts `(key, data_pos)` into the active index. Returns `false`
    /// (with no side effects) for a duplicate key under UNIQUE.
    pub fn insert(&self, key: &[u8], data_pos: i64) -> Result<bool> {
        self.with_tree(false, |tree| tree.insert(key, data_pos), check_key(key))
    }

    /// Looks up `key` and returns its data position, or [`NIL_POS`] when
    /// absent. On a miss the cursor is left on the next larger key.
    pub fn find(&self, key: &[u8]) -> Result<i64> {
        self.with_tree(NIL_POS, |tree| tree.find(key), check_key(key))
    }

    /// Deletes every entry with `key`. Returns `false` when absent.
    pub fn delete_all(&self, key: &[u8]) -> Result<bool> {
        self.with_tree(false, |tree| tree.delete_all(key), check_key(key))
    }

    /// Deletes the entry under the cursor and returns its data position,
    /// or [`NIL_POS`] when the cursor is not on an entry.
    pub fn delete_current(&self) -> Result<i64> {
        self.with_tree(NIL_POS, |tree| tree.delete_current(), |_| Ok(()))
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Positions on the first entry; optionally copies its key into
    /// `key_out` (which must be exactly `key_size` bytes).
    pub fn first(&self, key_out: Option<&mut [u8]>) -> Result<i64> {
        let check = key_out_len(&key_out);
        self.with_tree(NIL_POS, |tree| tree.first(key_out), check)
    }

    /// Advances to the next entry in key order.
    pub fn next(&self, key_out: Option<&mut [u8]>) -> Result<i64> {
        let check = key_out_len(&key_out);
        self.with_tree(NIL_POS, |tree| tree.next(key_out), check)
    }

    /// Steps back to the previous entry in key order.
    pub fn prev(&self, key_out: Option<&mut [u8]>) -> Result<i64> {
        let check = key_out_len(&key_out);
        self.with_tree(NIL_POS, |tree| tree.prev(key_out), check)
    }

    /// Re-reads the entry under the cursor.
    pub fn current(&self, key_out: Option<&mut [u8]>) -> Result<i64> {
        let check = key_out_len(&key_out);
        self.with_tree(NIL_POS, |tree| tree.current(key_out), check)
    }

    /// Whether the cursor sits on the first entry (or the index is empty).
    pub fn is_bof(&self) -> bool {
        let guard = self.state.lock();
        let set = guard.borrow();
        self.device.has_error() || set.cursors[set.current].is_bof()
    }

    /// Whether the cursor sits on the last entry (or the index is empty).
    pub fn is_eof(&self) -> bool {
        let guard = self.state.lock();
        let set = guard.borrow();
        self.device.has_error() || set.cursors[set.current].is_eof()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Writes the file header back to disk.
    pub fn flush_index(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut set = guard.borrow_mut();
        write_header(&self.device, &mut set.header)
    }

    /// Writes the whole `IndexInfo` array back to disk.
    pub fn flush_file(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut set = guard.borrow_mut();
        let set = &mut *set;
        for (i, info) in set.infos.iter_mut().enumerate() {
            write_info(&self.device, info, i)?;
        }
        Ok(())
    }

    /// The most recent failure kind, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.device.last_error()
    }

    /// Whether a failure has been latched.
    pub fn has_error(&self) -> bool {
        self.device.has_error()
    }

    /// Clears the latched failure so operations resume.
    pub fn clear_error(&self) {
        self.device.clear_error()
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Runs `op` on a [`Tree`] view of the active index. When the device
    /// has a latched error the call short-circuits to `idle` without
    /// touching the file; an uninitialized index gets the same treatment.
    fn with_tree<T, F, C>(&self, idle: T, op: F, check: C) -> Result<T>
    where
        F: FnOnce(&mut Tree<'_>) -> Result<T>,
        C: FnOnce(&IndexInfo) -> Result<()>,
    {
        let guard = self.state.lock();
        let mut set = guard.borrow_mut();
        let set = &mut *set;

        if self.device.has_error() {
            return Ok(idle);
        }

        let current = set.current;
        let info = &mut set.infos[current];
        let Some(kt) = KeyType::from_raw(info.key_type_raw()) else {
            return Ok(idle);
        };
        check(info)?;

        let mut tree = Tree::new(&self.device, info, &mut set.cursors[current], kt);
        op(&mut tree)
    }
}

impl Drop for MultiIndex {
    fn drop(&mut self) {
        let flush = || -> Result<()> {
            let guard = self.state.lock();
            let mut set = guard.borrow_mut();
            let set = &mut *set;
            write_header(&self.device, &mut set.header)?;
            for (i, info) in set.infos.iter_mut().enumerate() {
                write_info(&self.device, info, i)?;
            }
            self.device.flush()
        };
        if let Err(e) = flush() {
            warn!(error = %e, "flush on close failed; index metadata may be stale");
        }
    }
}

impl std::fmt::Debug for MultiIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiIndex")
            .field("num_indexes", &self.num_indexes())
            .field("active_index", &self.active_index())
            .field("device", &self.device)
            .finish()
    }
}

fn write_header(dev: &BlockDevice, header: &mut FileHeader) -> Result<()> {
    header.seal();
    dev.write_at(header.as_bytes(), 0)
}

fn write_info(dev: &BlockDevice, info: &mut IndexInfo, index_no: usize) -> Result<()> {
    info.seal();
    dev.write_at(
        info.as_bytes(),
        (FILE_HEADER_SIZE + index_no * INDEX_INFO_SIZE) as u64,
    )
}

fn check_key(key: &[u8]) -> impl FnOnce(&IndexInfo) -> Result<()> + '_ {
    move |info: &IndexInfo| {
        if key.len() != info.key_size() as usize {
            return Err(eyre::Report::new(ErrorKind::InvalidArgument).wrap_err(format!(
                "key buffer is {} bytes but the index key size is {}",
                key.len(),
                info.key_size()
            )));
        }
        Ok(())
    }
}

fn key_out_len(key_out: &Option<&mut [u8]>) -> impl Fn(&IndexInfo) -> Result<()> {
    let len = key_out.as_ref().map(|k| k.len());
    move |info: &IndexInfo| {
        if let Some(len) = len {
            if len != info.key_size() as usize {
                return Err(eyre::Report::new(ErrorKind::InvalidArgument).wrap_err(format!(
                    "key output buffer is {} bytes but the index key size is {}",
                    len,
                    info.key_size()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl MultiIndex {
    /// Walks the active index's leaf free list (test instrumentation).
    fn free_leaf_count(&self) -> usize {
        self.with_tree(0, |tree| {
            let mut count = 0;
            let mut pos = tree.info.free_leaf();
            while pos != NIL_POS {
                let leaf = tree.read_leaf(pos)?;
                pos = leaf.next_leaf();
                count += 1;
            }
            Ok(count)
        }, |_| Ok(()))
        .unwrap()
    }

    /// Walks the active index's node free list (test instrumentation).
    fn free_node_count(&self) -> usize {
        self.with_tree(0, |tree| {
            let mut count = 0;
            let mut pos = tree.info.free_node();
            while pos != NIL_POS {
                let node = tree.read_node(pos)?;
                pos = node.next_node();
                count += 1;
            }
            Ok(count)
        }, |_| Ok(()))
        .unwrap()
    }

    /// Leaf-chain length excluding the EOF sentinel (test instrumentation).
    fn live_leaf_count(&self) -> usize {
        self.with_tree(0, |tree| {
            let mut count = 0;
            let mut pos = tree.info.first_leaf();
            while pos != NIL_POS && pos != tree.info.last_leaf() {
                let leaf = tree.read_leaf(pos)?;
                pos = leaf.next_leaf();
                count += 1;
            }
            Ok(count)
        }, |_| Ok(()))
        .unwrap()
    }

    /// Root node position of the active index (test instrumentation).
    fn root_pos(&self) -> i64 {
        let guard = self.state.lock();
        let set = guard.borrow();
        set.infos[set.current].root()
    }

    fn device(&self) -> &BlockDevice {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn str_key(s: &str, size: usize) -> Vec<u8> {
        assert!(s.len() < size, "string key needs room for its terminator");
        let mut key = vec![0u8; size];
        key[..s.len()].copy_from_slice(s.as_bytes());
        key
    }

    fn int32_key(v: i32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn new_index(
        name: &str,
        key_type: KeyType,
        key_size: u16,
        attrs: IndexAttrs,
        max_items: u16,
    ) -> (tempfile::TempDir, MultiIndex) {
        let dir = tempdir().unwrap();
        let index = MultiIndex::create(dir.path().join(name), 1).unwrap();
        index
            .init_index(key_type, key_size, attrs, max_items, 100, 200)
            .unwrap();
        (dir, index)
    }

    fn forward_scan(index: &MultiIndex, key_size: usize) -> Vec<(Vec<u8>, i64)> {
        let mut out = Vec::new();
        let mut key = vec![0u8; key_size];
        let mut pos = index.first(Some(&mut key)).unwrap();
        while pos != NIL_POS {
            out.push((key.clone(), pos));
            pos = index.next(Some(&mut key)).unwrap();
        }
        out
    }

    // ---- scenario: string keys, fan-out 5 --------------------------------

    #[test]
    fn string_keys_insert_find_scan() {
        let (_dir, index) = new_index("s1.ndx", KeyType::Str, 32, IndexAttrs::NONE, 5);

        assert!(index.insert(&str_key("Alice", 32), 1000).unwrap());
        assert!(index.insert(&str_key("Bob", 32), 2000).unwrap());
        assert!(index.insert(&str_key("Charlie", 32), 3000).unwrap());

        assert_eq!(index.find(&str_key("Bob", 32)).unwrap(), 2000);

        let scan = forward_scan(&index, 32);
        let names: Vec<_> = scan
            .iter()
            .map(|(k, _)| {
                let end = k.iter().position(|&b| b == 0).unwrap();
                String::from_utf8_lossy(&k[..end]).into_owned()
            })
            .collect();
        assert_eq!(names, ["Alice", "Bob", "Charlie"]);
        assert_eq!(
            scan.iter().map(|(_, p)| *p).collect::<Vec<_>>(),
            [1000, 2000, 3000]
        );
    }

    // ---- scenario: UNIQUE constraint -------------------------------------

    #[test]
    fn unique_index_rejects_duplicates_without_side_effects() {
        let (_dir, index) = new_index(
            "s2.ndx",
            KeyType::Str,
            16,
            IndexAttrs::UNIQUE | IndexAttrs::ALLOW_DELETE,
            5,
        );
        let key = str_key("Key", 16);

        assert!(index.insert(&key, 100).unwrap());
        let free_before = index.free_leaf_count();

        assert!(!index.insert(&key, 200).unwrap());

        // the rejected insert must not leak a leaf or perturb the chain
        assert_eq!(index.free_leaf_count(), free_before);
        assert_eq!(index.live_leaf_count(), 1);
        assert_eq!(index.find(&key).unwrap(), 100);

        assert!(index.delete_all(&key).unwrap());
        assert!(index.insert(&key, 300).unwrap());
        assert_eq!(index.find(&key).unwrap(), 300);
    }

    // ---- scenario: split cascade -----------------------------------------

    #[test]
    fn fifty_string_keys_with_fan_out_three() {
        let (_dir, index) = new_index("s3.ndx", KeyType::Str, 16, IndexAttrs::NONE, 3);

        for i in 1..=50 {
            let key = str_key(&format!("Key{}", i), 16);
            assert!(index.insert(&key, i as i64).unwrap(), "insert Key{}", i);
        }

        for i in 1..=50 {
            let key = str_key(&format!("Key{}", i), 16);
            assert_eq!(index.find(&key).unwrap(), i as i64, "find Key{}", i);
        }

        // forward scan follows string collation, not numeric order
        let mut expected: Vec<String> = (1..=50).map(|i| format!("Key{}", i)).collect();
        expected.sort();
        let names: Vec<_> = forward_scan(&index, 16)
            .iter()
            .map(|(k, _)| {
                let end = k.iter().position(|&b| b == 0).unwrap();
                String::from_utf8_lossy(&k[..end]).into_owned()
            })
            .collect();
        assert_eq!(names, expected);
    }

    // ---- scenario: random-order INT32 ------------------------------------

    #[test]
    fn shuffled_int32_inserts_scan_sorted() {
        let (_dir, index) = new_index("s4.ndx", KeyType::Int32, 4, IndexAttrs::NONE, 5);

        let mut values: Vec<i32> = (1..=100).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        values.shuffle(&mut rng);

        for &v in &values {
            assert!(index.insert(&int32_key(v), v as i64 * 10).unwrap());
        }

        let scan = forward_scan(&index, 4);
        let data: Vec<i64> = scan.iter().map(|(_, p)| *p).collect();
        let expected: Vec<i64> = (1..=100).map(|v| v * 10).collect();
        assert_eq!(data, expected);

        let keys: Vec<i32> = scan
            .iter()
            .map(|(k, _)| i32::from_le_bytes([k[0], k[1], k[2], k[3]]))
            .collect();
        assert_eq!(keys, (1..=100).collect::<Vec<_>>());
    }

    // ---- scenario: delete rebalance --------------------------------------

    #[test]
    fn deleting_in_order_drains_to_the_sentinel() {
        let (_dir, index) = new_index("s5.ndx", KeyType::Str, 16, IndexAttrs::ALLOW_DELETE, 3);

        for i in 1..=20 {
            assert!(index.insert(&str_key(&format!("Key{}", i), 16), i).unwrap());
        }

        let mut remaining: Vec<String> = (1..=20).map(|i| format!("Key{}", i)).collect();
        for i in 1..=20 {
            let name = format!("Key{}", i);
            assert!(index.delete_all(&str_key(&name, 16)).unwrap(), "{}", name);
            remaining.retain(|n| *n != name);

            let mut expected = remaining.clone();
            expected.sort();
            let names: Vec<_> = forward_scan(&index, 16)
                .iter()
                .map(|(k, _)| {
                    let end = k.iter().position(|&b| b == 0).unwrap();
                    String::from_utf8_lossy(&k[..end]).into_owned()
                })
                .collect();
            assert_eq!(names, expected, "scan after deleting {}", name);
        }

        assert_eq!(index.live_leaf_count(), 0);
        assert_eq!(index.first(None).unwrap(), NIL_POS);
    }

    // ---- scenario: persistence -------------------------------------------

    #[test]
    fn close_and_reopen_preserves_two_indexes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.ndx");

        {
            let index = MultiIndex::create(&path, 2).unwrap();
            index.set_active_index(1);
            index
                .init_index(KeyType::Str, 24, IndexAttrs::ALLOW_DELETE, 5, 100, 200)
                .unwrap();
            for i in 0..50 {
                let key = str_key(&format!("name{:02}", i), 24);
                assert!(index.insert(&key, i).unwrap());
            }
        } // drop flushes

        let index = MultiIndex::open(&path).unwrap();
        assert_eq!(index.num_indexes(), 2);

        index.set_active_index(1);
        assert_eq!(index.key_type(), Some(KeyType::Str));
        assert_eq!(index.key_size(), 24);
        for i in 0..50 {
            let key = str_key(&format!("name{:02}", i), 24);
            assert_eq!(index.find(&key).unwrap(), i, "name{:02}", i);
        }

        // the second index never got initialized and stays inert
        index.set_active_index(2);
        assert_eq!(index.key_type(), None);
        assert_eq!(index.find(&[0u8; 0]).unwrap(), NIL_POS);
    }

    // ---- universal properties --------------------------------------------

    #[test]
    fn duplicates_find_newest_then_walk_older() {
        let (_dir, index) = new_index("dup.ndx", KeyType::Str, 16, IndexAttrs::NONE, 5);
        let key = str_key("same", 16);

        for data in [10, 20, 30] {
            assert!(index.insert(&key, data).unwrap());
        }

        assert_eq!(index.find(&key).unwrap(), 30);
        assert_eq!(index.next(None).unwrap(), 20);
        assert_eq!(index.next(None).unwrap(), 10);
        assert_eq!(index.next(None).unwrap(), NIL_POS);
    }

    #[test]
    fn delete_then_find_returns_nil() {
        let (_dir, index) = new_index(
            "df.ndx",
            KeyType::Str,
            16,
            IndexAttrs::UNIQUE | IndexAttrs::ALLOW_DELETE,
            5,
        );
        let key = str_key("ghost", 16);
        assert!(index.insert(&key, 42).unwrap());

        assert!(index.delete_all(&key).unwrap());

        assert_eq!(index.find(&key).unwrap(), NIL_POS);
        assert!(!index.delete_all(&key).unwrap());
    }

    #[test]
    fn reverse_traversal_mirrors_forward() {
        let (_dir, index) = new_index("rev.ndx", KeyType::Str, 16, IndexAttrs::NONE, 3);
        for name in ["ant", "bee", "cat", "dog", "emu"] {
            assert!(index.insert(&str_key(name, 16), 1).unwrap());
        }

        // walk forward to the last entry
        let mut pos = index.first(None).unwrap();
        assert!(pos != NIL_POS);
        loop {
            let next = index.next(None).unwrap();
            if next == NIL_POS {
                break;
            }
            pos = next;
        }
        assert!(index.is_eof());
        let _ = pos;

        // then backward, collecting keys
        let mut names = Vec::new();
        let mut key = vec![0u8; 16];
        index.current(Some(&mut key)).unwrap();
        loop {
            let end = key.iter().position(|&b| b == 0).unwrap();
            names.push(String::from_utf8_lossy(&key[..end]).into_owned());
            if index.prev(Some(&mut key)).unwrap() == NIL_POS {
                break;
            }
        }

        assert_eq!(names, ["emu", "dog", "cat", "bee", "ant"]);
        assert!(index.is_bof());
    }

    #[test]
    fn random_churn_returns_all_blocks_to_the_free_lists() {
        let (_dir, index) = new_index("churn.ndx", KeyType::Str, 16, IndexAttrs::ALLOW_DELETE, 3);

        let free_leaves_start = index.free_leaf_count();
        let free_nodes_start = index.free_node_count();

        let mut names: Vec<String> = (0..40).map(|i| format!("item{:02}", i)).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        names.shuffle(&mut rng);
        for name in &names {
            assert!(index.insert(&str_key(name, 16), 1).unwrap());
        }

        names.shuffle(&mut rng);
        for name in &names {
            assert!(index.delete_all(&str_key(name, 16)).unwrap(), "{}", name);
        }

        // one more stacked descent collapses any leftover single-item root
        // chain (plain find descends without tidying)
        assert!(!index.delete_all(&str_key("item00", 16)).unwrap());
        assert_eq!(index.find(&str_key("item00", 16)).unwrap(), NIL_POS);

        assert_eq!(index.live_leaf_count(), 0);
        assert_eq!(index.free_leaf_count(), free_leaves_start);
        // the tree is back to a single root node
        assert_eq!(
            index.free_node_count(),
            free_nodes_start,
            "all split nodes must be recycled"
        );
    }

    #[test]
    fn file_size_stabilizes_across_insert_delete_cycles() {
        let (_dir, index) = new_index("cycle.ndx", KeyType::Str, 16, IndexAttrs::ALLOW_DELETE, 3);

        let run = |index: &MultiIndex| {
            for i in 0..40 {
                assert!(index.insert(&str_key(&format!("k{:02}", i), 16), i).unwrap());
            }
            for i in 0..40 {
                assert!(index.delete_all(&str_key(&format!("k{:02}", i), 16)).unwrap());
            }
        };

        run(&index);
        let size_after_first = index.device().size().unwrap();
        run(&index);

        assert_eq!(index.device().size().unwrap(), size_after_first);
    }

    // ---- container behavior ----------------------------------------------

    #[test]
    fn two_indexes_are_independent() {
        let dir = tempdir().unwrap();
        let index = MultiIndex::create(dir.path().join("two.ndx"), 2).unwrap();

        index.set_active_index(1);
        index
            .init_index(KeyType::Str, 16, IndexAttrs::NONE, 5, 50, 100)
            .unwrap();
        index.set_active_index(2);
        index
            .init_index(KeyType::Int32, 4, IndexAttrs::UNIQUE, 5, 50, 100)
            .unwrap();

        index.set_active_index(1);
        assert!(index.insert(&str_key("shared", 16), 111).unwrap());

        index.set_active_index(2);
        assert!(index.insert(&int32_key(7), 222).unwrap());
        assert_eq!(index.find(&int32_key(7)).unwrap(), 222);
        assert!(index.is_unique());

        index.set_active_index(1);
        assert_eq!(index.find(&str_key("shared", 16)).unwrap(), 111);
        assert!(!index.is_unique());
        assert_eq!(index.find(&str_key("missing", 16)).unwrap(), NIL_POS);
    }

    #[test]
    fn active_index_falls_back_to_one_when_out_of_range() {
        let dir = tempdir().unwrap();
        let index = MultiIndex::create(dir.path().join("range.ndx"), 2).unwrap();

        index.set_active_index(2);
        assert_eq!(index.active_index(), 2);

        index.set_active_index(0);
        assert_eq!(index.active_index(), 1);

        index.set_active_index(9);
        assert_eq!(index.active_index(), 1);
    }

    #[test]
    fn operations_on_uninitialized_index_are_inert() {
        let dir = tempdir().unwrap();
        let index = MultiIndex::create(dir.path().join("inert.ndx"), 1).unwrap();

        assert_eq!(index.key_type(), None);
        assert!(!index.insert(b"", 1).unwrap());
        assert_eq!(index.find(b"").unwrap(), NIL_POS);
        assert!(!index.delete_all(b"").unwrap());
        assert_eq!(index.first(None).unwrap(), NIL_POS);
    }

    #[test]
    fn mis_sized_key_is_an_invalid_argument() {
        let (_dir, index) = new_index("len.ndx", KeyType::Str, 16, IndexAttrs::NONE, 5);

        let err = index.insert(b"short", 1).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn init_rejects_degenerate_parameters() {
        let dir = tempdir().unwrap();
        let index = MultiIndex::create(dir.path().join("bad.ndx"), 1).unwrap();

        // fan-out below the floor
        let err = index
            .init_index(KeyType::Str, 16, IndexAttrs::NONE, 2, 10, 10)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );

        // key size that cannot hold the type
        let err = index
            .init_index(KeyType::Int32, 2, IndexAttrs::NONE, 5, 10, 10)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn corruption_latches_and_short_circuits() {
        let (_dir, index) = new_index("rot.ndx", KeyType::Str, 16, IndexAttrs::NONE, 5);
        let key = str_key("stored", 16);
        assert!(index.insert(&key, 5).unwrap());

        // scribble over the root node behind the engine's back
        let root = index.root_pos();
        index.device().write_at(&[0xDE, 0xAD], root as u64 + 3).unwrap();

        let err = index.find(&key).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::Corruption)
        );
        assert_eq!(index.last_error(), Some(ErrorKind::Corruption));

        // latched: calls now short-circuit instead of failing again
        assert_eq!(index.find(&key).unwrap(), NIL_POS);
        assert!(!index.insert(&key, 6).unwrap());
    }

    #[test]
    fn create_rejects_zero_indexes() {
        let dir = tempdir().unwrap();

        let err = MultiIndex::create(dir.path().join("zero.ndx"), 0).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn open_rejects_a_corrupted_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hdr.ndx");
        drop(MultiIndex::create(&path, 1).unwrap());

        // flip a bit in the header on disk
        let device = BlockDevice::open(&path).unwrap();
        device.write_at(&[0xFF], 1).unwrap();
        device.close();

        let err = MultiIndex::open(&path).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::Corruption)
        );
    }

    #[test]
    fn find_miss_leaves_cursor_on_next_larger_key() {
        let (_dir, index) = new_index("miss.ndx", KeyType::Str, 16, IndexAttrs::NONE, 5);
        index.insert(&str_key("apple", 16), 1).unwrap();
        index.insert(&str_key("cherry", 16), 3).unwrap();

        assert_eq!(index.find(&str_key("banana", 16)).unwrap(), NIL_POS);

        let mut key = vec![0u8; 16];
        assert_eq!(index.current(Some(&mut key)).unwrap(), 3);
        assert!(key.starts_with(b"cherry\x00"));
    }

    #[test]
    fn bof_eof_flags_track_the_cursor() {
        let (_dir, index) = new_index("flags.ndx", KeyType::Str, 16, IndexAttrs::NONE, 5);
        index.insert(&str_key("a", 16), 1).unwrap();
        index.insert(&str_key("b", 16), 2).unwrap();
        index.insert(&str_key("c", 16), 3).unwrap();

        index.first(None).unwrap();
        assert!(index.is_bof());
        assert!(!index.is_eof());

        index.next(None).unwrap();
        assert!(!index.is_bof());
        assert!(!index.is_eof());

        index.next(None).unwrap();
        assert!(index.is_eof());
        assert_eq!(index.next(None).unwrap(), NIL_POS);
    }

    #[test]
    fn flush_file_persists_metadata_without_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flush.ndx");
        let index = MultiIndex::create(&path, 1).unwrap();
        index
            .init_index(KeyType::Str, 16, IndexAttrs::NONE, 5, 20, 40)
            .unwrap();
        index.insert(&str_key("k", 16), 9).unwrap();
        index.flush_index().unwrap();
        index.flush_file().unwrap();

        // read the metadata back through a second handle while the first
        // object is still alive (same-thread, sequential access)
        let probe = BlockDevice::open(&path).unwrap();
        let mut bytes = [0u8; INDEX_INFO_SIZE];
        probe
            .read_at(&mut bytes, FILE_HEADER_SIZE as u64)
            .unwrap();
        let info = IndexInfo::from_bytes(&bytes).unwrap();

        assert!(info.verify());
        assert_eq!(info.key_size(), 16);
        assert_eq!(info.height(), 1);
        drop(index);
    }
}
