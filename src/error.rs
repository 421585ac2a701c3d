// src/error.rs

//! Error types for the journaled-I/O library
//!
//! Low-level I/O failures are surfaced verbatim through [`Error::Io`] so the
//! caller can inspect the original `io::Error`/errno. Library-defined
//! conditions get their own variants, one per error kind in the design
//! ("malformed-input", "contention", "storage", "resource", "state",
//! "journal-absent", "corruption").

use std::path::PathBuf;
use thiserror::Error;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Verbatim OS error from a read/write/fsync/lock syscall.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A transaction has no operations, a zero-length op was added, or an
    /// operation's offset/length overflowed.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A non-blocking lock acquisition would have blocked. Only surfaced
    /// during recovery, where it means "another process owns this record".
    #[error("resource contended: {0}")]
    Contention(String),

    /// A transaction file's checksum did not match its contents.
    #[error("corrupt transaction record {path}: checksum mismatch")]
    Corruption { path: PathBuf },

    /// The operation is invalid for the transaction's or handle's current
    /// state (already committed, already rolled back, read-only handle).
    #[error("invalid state: {0}")]
    State(String),

    /// The journal directory or its lock file is missing or unreadable.
    #[error("journal directory absent or unreadable: {0}")]
    JournalAbsent(PathBuf),

    /// Allocation failure or descriptor/resource exhaustion.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// The target data file does not exist.
    #[error("data file not found: {0}")]
    NotFound(PathBuf),

    /// `move_journal` target path already exists.
    #[error("journal move target already exists: {0}")]
    AlreadyExists(PathBuf),
}

impl Error {
    /// The raw OS errno, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
