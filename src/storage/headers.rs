//! # File Header Definitions
//!
//! Type-safe, zerocopy-backed records for the fixed metadata at the front of
//! NdxFile's two file kinds. Every record starts with a one-byte XOR
//! checksum sealed by [`seal`](crate::storage::seal_block) semantics: the
//! stored byte is chosen so the XOR over the whole record is zero.
//!
//! ## Records
//!
//! 1. **FileHeader** (3 bytes, index files) - number of indexes in the file.
//!    Written once at creation and immutable afterwards.
//! 2. **IndexInfo** (67 bytes, index files) - one per index, as an array
//!    directly after the file header. Carries the index's shape (key type,
//!    key size, fan-out), its free-list heads, pre-allocation batch sizes,
//!    and the tree anchors (height, root, first/last leaf).
//! 3. **HeapHeader** (11 bytes, heap files) - head of the holes-table chain
//!    and the per-table record capacity.
//!
//! ## Layout Rules
//!
//! All multi-byte fields are little-endian via `zerocopy::little_endian`
//! wrapper types, which have alignment 1; combined with `#[repr(C)]` this
//! pins the packed on-disk layout with no padding, checked by compile-time
//! size assertions below. Positions use `i64` with `-1` as nil; `-1` is a
//! legal stored value everywhere, including inside sealed records.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I64, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::NIL_POS;
use crate::storage::xor_checksum;

pub const FILE_HEADER_SIZE: usize = 3;
pub const INDEX_INFO_SIZE: usize = 67;
pub const HEAP_HEADER_SIZE: usize = 11;

/// Header of a MultiIndex file: `{ checksum, num_indexes }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    checksum: u8,
    num_indexes: U16,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(num_indexes: u16) -> Self {
        Self {
            checksum: 0,
            num_indexes: U16::new(num_indexes),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        Self::read_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    pub fn num_indexes(&self) -> u16 {
        self.num_indexes.get()
    }

    /// Recomputes the checksum byte so the record XORs to zero.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = xor_checksum(self.as_bytes());
    }

    pub fn verify(&self) -> bool {
        xor_checksum(self.as_bytes()) == 0
    }
}

/// Per-index metadata record, stored as an array after the file header.
///
/// An all-defaults record (key type 0, zero key size, nil anchors) is legal
/// on disk and denotes an index that has not been through `init_index` yet.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexInfo {
    checksum: u8,
    attrs: U16,
    key_type: U16,
    key_size: U16,
    max_items: U16,
    node_batch: I64,
    leaf_batch: I64,
    free_node: I64,
    free_leaf: I64,
    height: U16,
    root: I64,
    first_leaf: I64,
    last_leaf: I64,
}

const _: () = assert!(std::mem::size_of::<IndexInfo>() == INDEX_INFO_SIZE);

impl IndexInfo {
    /// A fresh, uninitialized index slot: no type, no tree, empty free
    /// lists.
    pub fn new_uninit() -> Self {
        Self {
            checksum: 0,
            attrs: U16::new(0),
            key_type: U16::new(0),
            key_size: U16::new(0),
            max_items: U16::new(0),
            node_batch: I64::new(0),
            leaf_batch: I64::new(0),
            free_node: I64::new(NIL_POS),
            free_leaf: I64::new(NIL_POS),
            height: U16::new(0),
            root: I64::new(NIL_POS),
            first_leaf: I64::new(NIL_POS),
            last_leaf: I64::new(NIL_POS),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= INDEX_INFO_SIZE,
            "buffer too small for IndexInfo: {} < {}",
            bytes.len(),
            INDEX_INFO_SIZE
        );
        Self::read_from_bytes(&bytes[..INDEX_INFO_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse IndexInfo: {:?}", e))
    }

    pub fn attrs(&self) -> u16 {
        self.attrs.get()
    }

    pub fn set_attrs(&mut self, attrs: u16) {
        self.attrs = U16::new(attrs);
    }

    pub fn key_type_raw(&self) -> u16 {
        self.key_type.get()
    }

    pub fn set_key_type_raw(&mut self, key_type: u16) {
        self.key_type = U16::new(key_type);
    }

    pub fn key_size(&self) -> u16 {
        self.key_size.get()
    }

    pub fn set_key_size(&mut self, size: u16) {
        self.key_size = U16::new(size);
    }

    pub fn max_items(&self) -> u16 {
        self.max_items.get()
    }

    pub fn set_max_items(&mut self, max_items: u16) {
        self.max_items = U16::new(max_items);
    }

    pub fn node_batch(&self) -> i64 {
        self.node_batch.get()
    }

    pub fn set_node_batch(&mut self, batch: i64) {
        self.node_batch = I64::new(batch);
    }

    pub fn leaf_batch(&self) -> i64 {
        self.leaf_batch.get()
    }

    pub fn set_leaf_batch(&mut self, batch: i64) {
        self.leaf_batch = I64::new(batch);
    }

    pub fn free_node(&self) -> i64 {
        self.free_node.get()
    }

    pub fn set_free_node(&mut self, pos: i64) {
        self.free_node = I64::new(pos);
    }

    pub fn free_leaf(&self) -> i64 {
        self.free_leaf.get()
    }

    pub fn set_free_leaf(&mut self, pos: i64) {
        self.free_leaf = I64::new(pos);
    }

    pub fn height(&self) -> u16 {
        self.height.get()
    }

    pub fn set_height(&mut self, height: u16) {
        self.height = U16::new(height);
    }

    pub fn inc_height(&mut self) {
        self.height = U16::new(self.height.get() + 1);
    }

    pub fn dec_height(&mut self) {
        self.height = U16::new(self.height.get().saturating_sub(1));
    }

    pub fn root(&self) -> i64 {
        self.root.get()
    }

    pub fn set_root(&mut self, pos: i64) {
        self.root = I64::new(pos);
    }

    pub fn first_leaf(&self) -> i64 {
        self.first_leaf.get()
    }

    pub fn set_first_leaf(&mut self, pos: i64) {
        self.first_leaf = I64::new(pos);
    }

    pub fn last_leaf(&self) -> i64 {
        self.last_leaf.get()
    }

    pub fn set_last_leaf(&mut self, pos: i64) {
        self.last_leaf = I64::new(pos);
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = xor_checksum(self.as_bytes());
    }

    pub fn verify(&self) -> bool {
        xor_checksum(self.as_bytes()) == 0
    }
}

/// Header of a HeapFile: `{ checksum, first_holes_table, holes_table_size }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeapHeader {
    checksum: u8,
    first_holes_table: I64,
    holes_table_size: U16,
}

const _: () = assert!(std::mem::size_of::<HeapHeader>() == HEAP_HEADER_SIZE);

impl HeapHeader {
    pub fn new(holes_table_size: u16) -> Self {
        Self {
            checksum: 0,
            first_holes_table: I64::new(NIL_POS),
            holes_table_size: U16::new(holes_table_size),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEAP_HEADER_SIZE,
            "buffer too small for HeapHeader: {} < {}",
            bytes.len(),
            HEAP_HEADER_SIZE
        );
        Self::read_from_bytes(&bytes[..HEAP_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse HeapHeader: {:?}", e))
    }

    pub fn first_holes_table(&self) -> i64 {
        self.first_holes_table.get()
    }

    pub fn set_first_holes_table(&mut self, pos: i64) {
        self.first_holes_table = I64::new(pos);
    }

    pub fn holes_table_size(&self) -> u16 {
        self.holes_table_size.get()
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = xor_checksum(self.as_bytes());
    }

    pub fn verify(&self) -> bool {
        xor_checksum(self.as_bytes()) == 0
    }
}
