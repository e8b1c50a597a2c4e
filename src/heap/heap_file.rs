//! # HeapFile Allocator
//!
//! Variable-length record space over a single file. The heap does not
//! interpret record contents; it hands out file offsets and remembers the
//! extents the caller gives back, reusing them first-fit on later
//! allocations.
//!
//! ## Allocation
//!
//! ```text
//! allocate(size):
//!   walk the holes-table chain, first-fit scan each table's records
//!     exact fit   -> swap the last record into the slot, shrink num_used
//!     larger hole -> shrink it in place (position += size, size -= size)
//!   no fit        -> return the current file size (the caller's write at
//!                    that offset extends the file)
//!
//! free(pos, size):
//!   append a record to the first table with room; when every table is
//!   full, append a new table block at end-of-file and link it from the
//!   chain tail (or the header when the chain was empty)
//! ```
//!
//! ## Caller Hazards
//!
//! The heap does not track live-record sizes: the caller must pass the
//! correct size to [`HeapFile::free`]. There is no double-free detection
//! and freed extents are never coalesced or compacted.
//!
//! ## Concurrency
//!
//! Public calls serialize on the object's re-entrant mutex; allocation is
//! atomic per object, so no two callers receive the same position through
//! the same `HeapFile`.

use std::cell::RefCell;
use std::path::Path;

use eyre::Result;
use parking_lot::ReentrantMutex;
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::config::NIL_POS;
use crate::error::ErrorKind;
use crate::storage::{seal_block, verify_block, BlockDevice, HeapHeader, HEAP_HEADER_SIZE};

use super::holes::HolesTableBuf;

/// A heap-structured file with first-fit reuse of freed extents.
pub struct HeapFile {
    device: BlockDevice,
    state: ReentrantMutex<RefCell<HeapHeader>>,
}

impl HeapFile {
    /// Creates a new heap file whose holes tables hold `holes_table_size`
    /// records each.
    pub fn create<P: AsRef<Path>>(path: P, holes_table_size: u16) -> Result<Self> {
        if holes_table_size == 0 {
            return Err(eyre::Report::new(ErrorKind::InvalidArgument)
                .wrap_err("holes tables need at least one record slot"));
        }

        let device = BlockDevice::create(&path)?;
        let mut header = HeapHeader::new(holes_table_size);
        write_header(&device, &mut header)?;

        debug!(
            path = %path.as_ref().display(),
            holes_table_size, "created heap file"
        );

        Ok(Self {
            device,
            state: ReentrantMutex::new(RefCell::new(header)),
        })
    }

    /// Opens an existing heap file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let device = BlockDevice::open(&path)?;

        let mut bytes = [0u8; HEAP_HEADER_SIZE];
        let got = device.read_at(&mut bytes, 0)?;
        if got != HEAP_HEADER_SIZE {
            device.set_error(ErrorKind::Corruption);
            return Err(eyre::Report::new(ErrorKind::Corruption).wrap_err("truncated heap header"));
        }
        let header = HeapHeader::from_bytes(&bytes)?;
        if !header.verify() {
            device.set_error(ErrorKind::Corruption);
            return Err(
                eyre::Report::new(ErrorKind::Corruption).wrap_err("heap header checksum mismatch")
            );
        }

        debug!(path = %path.as_ref().display(), "opened heap file");

        Ok(Self {
            device,
            state: ReentrantMutex::new(RefCell::new(header)),
        })
    }

    /// Reserves `size` bytes and returns the extent's file offset.
    ///
    /// The heap only bookkeeps: a position at or past end-of-file is
    /// claimed by the caller's subsequent write there.
    pub fn allocate(&self, size: i64) -> Result<i64> {
        if size <= 0 {
            return Err(eyre::Report::new(ErrorKind::InvalidArgument)
                .wrap_err(format!("allocation size {} must be positive", size)));
        }

        let guard = self.state.lock();
        let mut header = guard.borrow_mut();
        if self.device.has_error() {
            return Ok(NIL_POS);
        }

        if let Some(pos) = self.find_suitable_hole(&mut header, size)? {
            return Ok(pos);
        }
        Ok(self.device.size()? as i64)
    }

    /// Returns the extent `(pos, size)` to the heap for reuse.
    ///
    /// The caller supplies the size; the heap never tracked it.
    pub fn free(&self, pos: i64, size: i64) -> Result<()> {
        if pos < HEAP_HEADER_SIZE as i64 || size <= 0 {
            return Err(eyre::Report::new(ErrorKind::InvalidArgument).wrap_err(format!(
                "cannot free extent at {} of size {}",
                pos, size
            )));
        }

        let guard = self.state.lock();
        let mut header = guard.borrow_mut();
        if let Some(kind) = self.device.last_error() {
            return Err(eyre::Report::new(kind).wrap_err("device has a latched error"));
        }

        self.add_hole(&mut header, pos, size)
    }

    /// Record capacity of each holes table (fixed at creation).
    pub fn holes_table_size(&self) -> u16 {
        let guard = self.state.lock();
        let header = guard.borrow();
        header.holes_table_size()
    }

    /// Head of the holes-table chain, nil while nothing was ever freed.
    pub fn first_holes_table(&self) -> i64 {
        let guard = self.state.lock();
        let header = guard.borrow();
        header.first_holes_table()
    }

    /// Reads raw bytes from the file (records live wherever `allocate`
    /// said).
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        self.device.read_at(buf, pos)
    }

    /// Writes raw bytes into the file, extending it when needed.
    pub fn write_at(&self, buf: &[u8], pos: u64) -> Result<()> {
        self.device.write_at(buf, pos)
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.device.size()
    }

    /// Forces written data to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.device.flush()
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
    // Holes-table plumbing
    // ------------------------------------------------------------------

    fn table_block_size(&self, header: &HeapHeader) -> usize {
        HolesTableBuf::block_size(header.holes_table_size())
    }

    fn read_table(&self, header: &HeapHeader, pos: i64) -> Result<HolesTableBuf> {
        let mut table = HolesTableBuf::new(header.holes_table_size());
        let want = self.table_block_size(header);
        let got = self.device.read_at(table.as_bytes_mut(), pos as u64)?;
        if got != want || !verify_block(table.as_bytes()) {
            self.device.set_error(ErrorKind::Corruption);
            warn!(pos, "holes table failed verification");
            return Err(eyre::Report::new(ErrorKind::Corruption)
                .wrap_err(format!("holes table at position {}", pos)));
        }
        Ok(table)
    }

    fn write_table(&self, table: &mut HolesTableBuf, pos: i64) -> Result<()> {
        seal_block(table.as_bytes_mut());
        self.device.write_at(table.as_bytes(), pos as u64)
    }

    /// First-fit walk over the chain. An exact fit swaps the last record
    /// into the vacated slot; a larger hole shrinks in place.
    fn find_suitable_hole(&self, header: &mut HeapHeader, size: i64) -> Result<Option<i64>> {
        let mut table_pos = header.first_holes_table();

        while table_pos != NIL_POS {
            let mut table = self.read_table(header, table_pos)?;
            let num_used = table.num_used();

            for i in 0..num_used {
                let (hole_pos, hole_size) = table.record(i);
                if hole_size < size {
                    continue;
                }

                if hole_size > size {
                    table.set_record(i, hole_pos + size, hole_size - size);
                } else {
                    if i < num_used - 1 {
                        let (last_pos, last_size) = table.record(num_used - 1);
                        table.set_record(i, last_pos, last_size);
                    }
                    table.set_num_used(num_used - 1);
                }

                self.write_table(&mut table, table_pos)?;
                return Ok(Some(hole_pos));
            }

            table_pos = table.next_table();
        }

        Ok(None)
    }

    /// Appends a hole record to the first table with room, growing the
    /// chain by one table when all are full.
    fn add_hole(&self, header: &mut HeapHeader, pos: i64, size: i64) -> Result<()> {
        let mut table_pos = header.first_holes_table();
        let mut tail_pos = NIL_POS;

        while table_pos != NIL_POS {
            let mut table = self.read_table(header, table_pos)?;
            if !table.is_full() {
                let num_used = table.num_used();
                table.set_record(num_used, pos, size);
                table.set_num_used(num_used + 1);
                return self.write_table(&mut table, table_pos);
            }
            tail_pos = table_pos;
            table_pos = table.next_table();
        }

        // every table is full (or none exists): append a fresh one
        let mut new_table = HolesTableBuf::new(header.holes_table_size());
        new_table.set_record(0, pos, size);
        new_table.set_num_used(1);
        let new_table_pos = self.device.size()? as i64;
        self.write_table(&mut new_table, new_table_pos)?;

        if tail_pos != NIL_POS {
            let mut tail = self.read_table(header, tail_pos)?;
            tail.set_next_table(new_table_pos);
            self.write_table(&mut tail, tail_pos)?;
        } else {
            header.set_first_holes_table(new_table_pos);
            write_header(&self.device, header)?;
        }

        Ok(())
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        let flush = || -> Result<()> {
            let guard = self.state.lock();
            let mut header = guard.borrow_mut();
            write_header(&self.device, &mut header)?;
            self.device.flush()
        };
        if let Err(e) = flush() {
            warn!(error = %e, "flush on close failed; heap header may be stale");
        }
    }
}

impl std::fmt::Debug for HeapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapFile")
            .field("holes_table_size", &self.holes_table_size())
            .field("first_holes_table", &self.first_holes_table())
            .field("device", &self.device)
            .finish()
    }
}

fn write_header(dev: &BlockDevice, header: &mut HeapHeader) -> Result<()> {
    header.seal();
    dev.write_at(header.as_bytes(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_heap(name: &str, table_size: u16) -> (tempfile::TempDir, HeapFile) {
        let dir = tempdir().unwrap();
        let heap = HeapFile::create(dir.path().join(name), table_size).unwrap();
        (dir, heap)
    }

    /// Reserves and claims an extent, the way real callers do.
    fn allocate_and_claim(heap: &HeapFile, size: i64) -> i64 {
        let pos = heap.allocate(size).unwrap();
        heap.write_at(&vec![0xCD; size as usize], pos as u64).unwrap();
        pos
    }

    #[test]
    fn fresh_heap_allocates_right_after_the_header() {
        let (_dir, heap) = new_heap("fresh.hp", 100);

        let pos = heap.allocate(64).unwrap();

        assert_eq!(pos, HEAP_HEADER_SIZE as i64);
        assert_eq!(heap.first_holes_table(), NIL_POS);
    }

    #[test]
    fn sequential_allocations_append() {
        let (_dir, heap) = new_heap("seq.hp", 100);

        let p1 = allocate_and_claim(&heap, 100);
        let p2 = allocate_and_claim(&heap, 200);
        let p3 = allocate_and_claim(&heap, 100);

        assert_eq!(p1, 11);
        assert_eq!(p2, 111);
        assert_eq!(p3, 311);
    }

    #[test]
    fn freed_extent_is_reused_first_fit_with_shrink() {
        let (_dir, heap) = new_heap("reuse.hp", 100);
        let _p1 = allocate_and_claim(&heap, 100);
        let p2 = allocate_and_claim(&heap, 200);
        let _p3 = allocate_and_claim(&heap, 100);

        heap.free(p2, 200).unwrap();

        // 150 fits into the 200-byte hole, which shrinks in place
        assert_eq!(heap.allocate(150).unwrap(), p2);
        // the remaining 50 bytes are an exact fit for the next 50
        assert_eq!(heap.allocate(50).unwrap(), p2 + 150);
        // the hole is gone: the next allocation appends
        let tail = heap.allocate(10).unwrap();
        assert_eq!(tail, heap.size().unwrap() as i64);
    }

    #[test]
    fn exact_fit_swaps_the_last_record_into_place() {
        let (_dir, heap) = new_heap("swap.hp", 100);
        let p1 = allocate_and_claim(&heap, 40);
        let p2 = allocate_and_claim(&heap, 60);
        let p3 = allocate_and_claim(&heap, 80);

        heap.free(p1, 40).unwrap();
        heap.free(p2, 60).unwrap();
        heap.free(p3, 80).unwrap();

        // exact fit on the first record; the table swaps p3's record in
        assert_eq!(heap.allocate(40).unwrap(), p1);
        // both remaining holes still usable
        assert_eq!(heap.allocate(80).unwrap(), p3);
        assert_eq!(heap.allocate(60).unwrap(), p2);
    }

    #[test]
    fn too_small_holes_are_skipped() {
        let (_dir, heap) = new_heap("skip.hp", 100);
        let p1 = allocate_and_claim(&heap, 30);
        let _p2 = allocate_and_claim(&heap, 500);

        heap.free(p1, 30).unwrap();

        // 100 does not fit the 30-byte hole: appends instead
        let pos = heap.allocate(100).unwrap();
        assert_ne!(pos, p1);
        assert_eq!(pos, heap.size().unwrap() as i64);
    }

    #[test]
    fn full_table_grows_the_chain() {
        let (_dir, heap) = new_heap("chain.hp", 2);
        let mut extents = Vec::new();
        for _ in 0..5 {
            extents.push(allocate_and_claim(&heap, 16));
        }

        for &pos in &extents {
            heap.free(pos, 16).unwrap();
        }

        // 5 holes with 2 records per table -> a chain of 3 tables
        assert_ne!(heap.first_holes_table(), NIL_POS);
        let mut tables = 0;
        let mut holes = 0;
        let header = HeapHeader::new(2); // capacity template for reads
        let mut pos = heap.first_holes_table();
        while pos != NIL_POS {
            let table = heap.read_table(&header, pos).unwrap();
            tables += 1;
            holes += table.num_used();
            pos = table.next_table();
        }
        assert_eq!(tables, 3);
        assert_eq!(holes, 5);

        // and every hole is still allocatable
        for _ in 0..5 {
            let pos = heap.allocate(16).unwrap();
            assert!(extents.contains(&pos));
        }
    }

    #[test]
    fn heap_header_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.hp");
        let p2;
        {
            let heap = HeapFile::create(&path, 100).unwrap();
            let _p1 = allocate_and_claim(&heap, 100);
            p2 = allocate_and_claim(&heap, 200);
            heap.free(p2, 200).unwrap();
        } // drop flushes the header

        let heap = HeapFile::open(&path).unwrap();

        assert_eq!(heap.holes_table_size(), 100);
        assert_ne!(heap.first_holes_table(), NIL_POS);
        assert_eq!(heap.allocate(150).unwrap(), p2);
    }

    #[test]
    fn record_data_roundtrips_through_the_heap() {
        let (_dir, heap) = new_heap("data.hp", 100);
        let record = b"a variable length record";

        let pos = heap.allocate(record.len() as i64).unwrap();
        heap.write_at(record, pos as u64).unwrap();

        let mut buf = vec![0u8; record.len()];
        heap.read_at(&mut buf, pos as u64).unwrap();
        assert_eq!(&buf, record);
    }

    #[test]
    fn allocate_rejects_nonpositive_sizes() {
        let (_dir, heap) = new_heap("zero.hp", 100);

        let err = heap.allocate(0).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn free_rejects_extents_inside_the_header() {
        let (_dir, heap) = new_heap("hdr.hp", 100);

        let err = heap.free(0, 32).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn open_rejects_a_corrupted_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rot.hp");
        drop(HeapFile::create(&path, 100).unwrap());

        let device = BlockDevice::open(&path).unwrap();
        device.write_at(&[0xFF], 2).unwrap();
        device.close();

        let err = HeapFile::open(&path).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::Corruption)
        );
    }

    #[test]
    fn create_rejects_zero_capacity_tables() {
        let dir = tempdir().unwrap();

        let err = HeapFile::create(dir.path().join("cap.hp"), 0).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidArgument)
        );
    }
}
