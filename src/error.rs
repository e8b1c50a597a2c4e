//! # Error Kinds
//!
//! NdxFile reports failures through [`eyre::Result`] like the rest of the
//! crate's call surface, but every failure that originates inside the engine
//! is tagged with an [`ErrorKind`] so callers that prefer checking over
//! catching can inspect the device's last-error field instead of matching on
//! message strings.
//!
//! ## Two Surfaces, One Kind
//!
//! Each failure is surfaced twice:
//!
//! 1. The returned `eyre::Report` carries the kind as its root cause, so it
//!    can be recovered with `report.downcast_ref::<ErrorKind>()`.
//! 2. The owning [`BlockDevice`](crate::storage::BlockDevice) records the
//!    kind in its last-error cell. Once set, container-level calls
//!    short-circuit and return NIL / `false` until the error is cleared.
//!
//! Transient conditions are *not* errors: a missing key, an empty index, a
//! duplicate insert into a UNIQUE index, or a delete of an absent key all
//! come back as [`NIL_POS`](crate::config::NIL_POS) or `false` and leave the
//! error state untouched.

use thiserror::Error;

/// Classification of engine failures.
///
/// Mirrors the on-disk engine's historical error codes: file I/O failures,
/// corruption (checksum mismatch), lifecycle misuse, and argument errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// A read from the underlying file failed.
    #[error("file read failed")]
    Read,
    /// A write to the underlying file failed.
    #[error("file write failed")]
    Write,
    /// A seek on the underlying file failed.
    #[error("file seek failed")]
    Seek,
    /// Opening an existing file failed.
    #[error("file open failed")]
    Open,
    /// Creating a new file failed.
    #[error("file create failed")]
    Create,
    /// A block read back from disk failed its XOR checksum.
    #[error("data corruption detected")]
    Corruption,
    /// An operation was attempted on a closed device.
    #[error("file is not open")]
    NotOpen,
    /// A caller-supplied argument was out of range or mis-sized.
    #[error("invalid argument")]
    InvalidArgument,
    /// An index was used before `init_index` or its metadata is unusable.
    #[error("index not initialized")]
    Init,
}
