//! # Holes Tables
//!
//! A holes table is a fixed-size block holding an array of `(position,
//! size)` records, each describing a reusable extent freed by the caller.
//! Tables form a singly linked chain rooted in the heap header; the record
//! capacity per table is fixed at file creation.
//!
//! ```text
//! holes table (11 + N * 16 bytes):
//!   { u8 chk; u16 num_used; i64 next_table_pos }
//!   then N records of { i64 position; i64 size }
//! ```
//!
//! Records are unordered; a free slot is always the one past `num_used`,
//! and removal swaps the last used record into the vacated slot. Unlike
//! tree items, hole records are 0-indexed.

use zerocopy::little_endian::{I64, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::NIL_POS;

pub const HOLES_TABLE_HEADER_SIZE: usize = 11;
pub const HOLE_RECORD_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HolesTableHeader {
    checksum: u8,
    num_used: U16,
    next_table_pos: I64,
}

const _: () = assert!(std::mem::size_of::<HolesTableHeader>() == HOLES_TABLE_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HoleRecord {
    position: I64,
    size: I64,
}

const _: () = assert!(std::mem::size_of::<HoleRecord>() == HOLE_RECORD_SIZE);

/// One holes-table block held in memory.
#[derive(Debug, Clone)]
pub(crate) struct HolesTableBuf {
    data: Vec<u8>,
}

impl HolesTableBuf {
    pub fn block_size(capacity: u16) -> usize {
        HOLES_TABLE_HEADER_SIZE + capacity as usize * HOLE_RECORD_SIZE
    }

    /// A zeroed table with no records and a nil chain link.
    pub fn new(capacity: u16) -> Self {
        let mut table = Self {
            data: vec![0; Self::block_size(capacity)],
        };
        table.reset();
        table
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.set_next_table(NIL_POS);
    }

    fn header(&self) -> &HolesTableHeader {
        HolesTableHeader::ref_from_bytes(&self.data[..HOLES_TABLE_HEADER_SIZE]).unwrap()
    }

    fn header_mut(&mut self) -> &mut HolesTableHeader {
        HolesTableHeader::mut_from_bytes(&mut self.data[..HOLES_TABLE_HEADER_SIZE]).unwrap()
    }

    pub fn capacity(&self) -> u16 {
        ((self.data.len() - HOLES_TABLE_HEADER_SIZE) / HOLE_RECORD_SIZE) as u16
    }

    pub fn num_used(&self) -> u16 {
        self.header().num_used.get()
    }

    pub fn set_num_used(&mut self, num: u16) {
        self.header_mut().num_used = U16::new(num);
    }

    pub fn next_table(&self) -> i64 {
        self.header().next_table_pos.get()
    }

    pub fn set_next_table(&mut self, pos: i64) {
        self.header_mut().next_table_pos = I64::new(pos);
    }

    pub fn is_full(&self) -> bool {
        self.num_used() >= self.capacity()
    }

    fn record_offset(&self, index: u16) -> usize {
        debug_assert!(index < self.capacity());
        HOLES_TABLE_HEADER_SIZE + index as usize * HOLE_RECORD_SIZE
    }

    /// Reads record `index` as `(position, size)`, 0-indexed.
    pub fn record(&self, index: u16) -> (i64, i64) {
        let offset = self.record_offset(index);
        let record = HoleRecord::ref_from_bytes(&self.data[offset..offset + HOLE_RECORD_SIZE])
            .unwrap();
        (record.position.get(), record.size.get())
    }

    pub fn set_record(&mut self, index: u16, position: i64, size: i64) {
        let offset = self.record_offset(index);
        let record = HoleRecord {
            position: I64::new(position),
            size: I64::new(size),
        };
        self.data[offset..offset + HOLE_RECORD_SIZE].copy_from_slice(record.as_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
