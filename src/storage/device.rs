//! # Block Device
//!
//! `BlockDevice` owns one open file handle and exposes random-access byte
//! I/O at explicit 64-bit offsets. It is the only place in the crate that
//! touches `std::fs`; everything above it deals in sealed blocks.
//!
//! ## Locking
//!
//! All operations serialize on a re-entrant mutex owned by the device.
//! Re-entrancy matters because public device methods are also called from
//! inside larger flows that already hold the lock on the same thread (a
//! free-list refill asks for `size()` between `write_at` calls, a close path
//! flushes first). With a plain mutex those sibling calls would deadlock;
//! with `parking_lot::ReentrantMutex` they simply nest.
//!
//! The mutable state behind the lock lives in a `RefCell`. Each public
//! method borrows it for exactly one primitive operation and releases it
//! before returning, so nesting public calls never double-borrows.
//!
//! ## Error Surface
//!
//! Failures return `eyre::Result` with an [`ErrorKind`] root cause *and*
//! latch the kind into the device's last-error field. The field exists for
//! callers that prefer checking over catching: the containers consult it to
//! short-circuit after corruption. Transient conditions (a short read at
//! end-of-file) are not failures.
//!
//! ## Write Visibility
//!
//! Writes go straight to the file handle, so within one thread every write
//! is observable by subsequent reads as soon as `write_at` returns.
//! [`BlockDevice::flush`] additionally forces the data to stable storage.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::Result;
use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::error::ErrorKind;

/// A single open file with positioned read/write, serialized behind a
/// re-entrant mutex.
pub struct BlockDevice {
    inner: ReentrantMutex<RefCell<DeviceInner>>,
}

struct DeviceInner {
    file: Option<File>,
    path: PathBuf,
    position: u64,
    last_error: Option<ErrorKind>,
}

impl BlockDevice {
    /// Creates a new file at `path`, truncating any existing one.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                eyre::Report::new(ErrorKind::Create)
                    .wrap_err(format!("failed to create '{}': {}", path.display(), e))
            })?;

        debug!(path = %path.display(), "created block device");

        Ok(Self::from_file(file, path))
    }

    /// Opens an existing file at `path` for read and write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                eyre::Report::new(ErrorKind::Open)
                    .wrap_err(format!("failed to open '{}': {}", path.display(), e))
            })?;

        debug!(path = %path.display(), "opened block device");

        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(DeviceInner {
                file: Some(file),
                path: path.to_path_buf(),
                position: 0,
                last_error: None,
            })),
        }
    }

    /// Reads up to `buf.len()` bytes starting at `pos` and returns the
    /// number of bytes actually read.
    ///
    /// A short read at end-of-file is not a failure; callers that require a
    /// full block check the returned count.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.read_at(buf, pos)
    }

    /// Writes all of `buf` starting at `pos`.
    ///
    /// Writing at or past the current end of file is legal and extends the
    /// file; any gap is zero-filled.
    pub fn write_at(&self, buf: &[u8], pos: u64) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.write_at(buf, pos)
    }

    /// Moves the logical file position and returns the new absolute offset.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.seek(pos)
    }

    /// Current size of the underlying file in bytes.
    pub fn size(&self) -> Result<u64> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.size()
    }

    /// Forces written data to stable storage.
    pub fn flush(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.flush()
    }

    /// Closes the file handle. Subsequent I/O fails with
    /// [`ErrorKind::NotOpen`].
    pub fn close(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.file.take().is_some() {
            debug!(path = %inner.path.display(), "closed block device");
        }
    }

    /// Whether the device still holds an open file handle.
    pub fn is_open(&self) -> bool {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.file.is_some()
    }

    /// Logical file position left behind by the last read, write or seek.
    pub fn position(&self) -> u64 {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.position
    }

    /// The most recent failure kind, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.last_error
    }

    /// Whether a failure has been recorded and not yet cleared.
    pub fn has_error(&self) -> bool {
        self.last_error().is_some()
    }

    /// Clears the last-error field.
    pub fn clear_error(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.last_error = None;
    }

    /// Records a failure kind detected by a higher layer (e.g. a checksum
    /// mismatch found while decoding a block this device returned).
    pub(crate) fn set_error(&self, kind: ErrorKind) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.last_error = Some(kind);
    }
}

impl std::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        f.debug_struct("BlockDevice")
            .field("path", &inner.path)
            .field("open", &inner.file.is_some())
            .field("last_error", &inner.last_error)
            .finish()
    }
}

impl DeviceInner {
    fn fail<T>(&mut self, kind: ErrorKind, context: String) -> Result<T> {
        self.last_error = Some(kind);
        Err(eyre::Report::new(kind).wrap_err(context))
    }

    fn read_at(&mut self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let path = self.path.clone();
        let Some(file) = self.file.as_mut() else {
            return self.fail(
                ErrorKind::NotOpen,
                format!("read on closed device '{}'", path.display()),
            );
        };

        if let Err(e) = file.seek(SeekFrom::Start(pos)) {
            return self.fail(
                ErrorKind::Seek,
                format!("seek to {} in '{}' failed: {}", pos, path.display(), e),
            );
        }

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return self.fail(
                        ErrorKind::Read,
                        format!(
                            "read of {} bytes at {} in '{}' failed: {}",
                            buf.len(),
                            pos,
                            path.display(),
                            e
                        ),
                    );
                }
            }
        }

        self.position = pos + total as u64;
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], pos: u64) -> Result<()> {
        let path = self.path.clone();
        let Some(file) = self.file.as_mut() else {
            return self.fail(
                ErrorKind::NotOpen,
                format!("write on closed device '{}'", path.display()),
            );
        };

        if let Err(e) = file.seek(SeekFrom::Start(pos)) {
            return self.fail(
                ErrorKind::Seek,
                format!("seek to {} in '{}' failed: {}", pos, path.display(), e),
            );
        }

        if let Err(e) = file.write_all(buf) {
            return self.fail(
                ErrorKind::Write,
                format!(
                    "write of {} bytes at {} in '{}' failed: {}",
                    buf.len(),
                    pos,
                    path.display(),
                    e
                ),
            );
        }

        self.position = pos + buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let path = self.path.clone();
        let Some(file) = self.file.as_mut() else {
            return self.fail(
                ErrorKind::NotOpen,
                format!("seek on closed device '{}'", path.display()),
            );
        };

        match file.seek(pos) {
            Ok(new_pos) => {
                self.position = new_pos;
                Ok(new_pos)
            }
            Err(e) => self.fail(
                ErrorKind::Seek,
                format!("seek in '{}' failed: {}", path.display(), e),
            ),
        }
    }

    fn size(&mut self) -> Result<u64> {
        let path = self.path.clone();
        let Some(file) = self.file.as_ref() else {
            return self.fail(
                ErrorKind::NotOpen,
                format!("size query on closed device '{}'", path.display()),
            );
        };

        match file.metadata() {
            Ok(meta) => Ok(meta.len()),
            Err(e) => self.fail(
                ErrorKind::Read,
                format!("size query on '{}' failed: {}", path.display(), e),
            ),
        }
    }

    fn flush(&mut self) -> Result<()> {
        let path = self.path.clone();
        let Some(file) = self.file.as_ref() else {
            return self.fail(
                ErrorKind::NotOpen,
                format!("flush on closed device '{}'", path.display()),
            );
        };

        match file.sync_all() {
            Ok(()) => Ok(()),
            Err(e) => self.fail(
                ErrorKind::Write,
                format!("flush of '{}' failed: {}", path.display(), e),
            ),
        }
    }
}
