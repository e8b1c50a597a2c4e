//! # NdxFile - Embeddable Multi-Index Storage Engine
//!
//! NdxFile is a single-file, on-disk indexing engine that maps
//! application-chosen keys to 64-bit record positions. It combines two
//! independent storage engines, both layered on a random-access binary file:
//!
//! - **MultiIndex**: a file holding one or more persistent B+tree indexes.
//!   Each index maps typed keys to opaque 64-bit data offsets and supports
//!   point lookup, range scan via a linked leaf chain, insert, delete, and
//!   switching between indexes within the same file.
//! - **HeapFile**: a file providing variable-length record space with
//!   first-fit reuse of deleted extents through a linked chain of holes
//!   tables.
//!
//! The two are designed to be used together: a record is written into a
//! `HeapFile`, and the offset the heap hands back is stored in one or more
//! `MultiIndex` indexes under the keys the application wants to look the
//! record up by.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ndxfile::{HeapFile, IndexAttrs, KeyType, MultiIndex, NIL_POS};
//!
//! let heap = HeapFile::create("data.hp", 100)?;
//! let index = MultiIndex::create("data.ndx", 1)?;
//! index.init_index(KeyType::Str, 32, IndexAttrs::ALLOW_DELETE, 5, 100, 200)?;
//!
//! let record = b"hello world";
//! let pos = heap.allocate(record.len() as i64)?;
//! heap.write_at(record, pos as u64)?;
//!
//! let mut key = [0u8; 32];
//! key[..5].copy_from_slice(b"hello");
//! index.insert(&key, pos)?;
//!
//! assert_eq!(index.find(&key)?, pos);
//! assert_eq!(index.find(&[0u8; 32])?, NIL_POS);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------+
//! |      Public API (MultiIndex  |  HeapFile)        |
//! +--------------------------------------------------+
//! |  B+Tree Engine          |  Holes-Table Allocator |
//! |  (descent, split/merge, |  (first-fit, shrink,   |
//! |   leaf chain, cursor)   |   append-on-miss)      |
//! +--------------------------------------------------+
//! |  Checksummed Block Layer (XOR-sealed blocks,     |
//! |  free-list batch allocation, zerocopy headers)   |
//! +--------------------------------------------------+
//! |  BlockDevice (positioned file I/O behind a       |
//! |  re-entrant mutex, last-error tracking)          |
//! +--------------------------------------------------+
//! ```
//!
//! ## File Format
//!
//! All on-disk structures are packed little-endian with no padding. Every
//! block carries a one-byte XOR checksum chosen so that the XOR over the
//! whole block reads back as zero. A position of `-1` ([`NIL_POS`]) means
//! "no such block / record / data" everywhere.
//!
//! ```text
//! index file:  [FileHeader][IndexInfo; n][node and leaf blocks ...]
//! heap file:   [HeapHeader][data extents and holes tables ...]
//! ```
//!
//! ## Concurrency Model
//!
//! Synchronous and caller-threaded. Every public call on a `MultiIndex` or
//! `HeapFile` is atomic with respect to other calls on the same object: each
//! object serializes behind its own re-entrant mutex, as does the underlying
//! `BlockDevice`. Concurrent access to the same file through *different*
//! objects is undefined; no file-level locking is provided.
//!
//! ## What NdxFile Is Not
//!
//! No transactions, no write-ahead log, no crash recovery, no hole
//! coalescing, no online compaction, no cross-endian portability, and no
//! cryptographic integrity (the XOR checksum detects bit rot, not malice).
//!
//! ## Module Overview
//!
//! - [`storage`]: block device, file headers, XOR checksum sealing
//! - [`btree`]: key codec, node/leaf blocks, free lists, the tree engine,
//!   and the [`MultiIndex`] container
//! - [`heap`]: holes tables and the [`HeapFile`] allocator
//! - [`config`]: centralized tunables and their interdependencies

pub mod btree;
pub mod config;
pub mod error;
pub mod heap;
pub mod storage;

pub use btree::{IndexAttrs, KeyType, MultiIndex};
pub use config::NIL_POS;
pub use error::ErrorKind;
pub use heap::HeapFile;
pub use storage::BlockDevice;
