// src/lock.rs

//! Advisory byte-range file locking
//!
//! Every lock taken by this crate — on the data file, on the lock file, on
//! an individual transaction file — goes through this module. Locks are
//! always anchored at absolute offsets (never `SEEK_CUR`), exclusive only
//! (this library has no readers that don't also write), and length `0`
//! means "to the end of the file", the standard POSIX `fcntl` convention.
//!
//! Implemented with `fcntl(F_SETLK[W])` rather than `flock(2)` because
//! `flock` has no byte-range concept; `fs2`, used elsewhere in this crate
//! for the lock file's whole-file counter lock, doesn't expose that
//! primitive.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::libc::{self, flock};

use crate::error::{Error, Result};

fn io_error(e: Errno) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(e as i32))
}

/// A byte range `[offset, offset + length)` on a file, or `[offset, EOF)`
/// when `length == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// The smallest range covering every range in `ranges`, as a single
    /// contiguous union when they form one, or just the outer bound
    /// otherwise — commit only needs "a superset that's safe to lock".
    pub fn union(ranges: &[Range]) -> Option<Range> {
        let mut iter = ranges.iter();
        let first = *iter.next()?;
        let mut start = first.offset;
        let mut end = if first.length == 0 {
            u64::MAX
        } else {
            first.offset + first.length
        };
        for r in iter {
            start = start.min(r.offset);
            end = if r.length == 0 {
                u64::MAX
            } else {
                end.max(r.offset + r.length)
            };
        }
        let length = if end == u64::MAX { 0 } else { end - start };
        Some(Range::new(start, length))
    }
}

fn make_flock(range: Range, lock_type: i16) -> flock {
    // SAFETY: `flock` is a plain-old-data struct; zeroing then filling the
    // fields fcntl actually reads is the usual way to build one in Rust.
    let mut fl: flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = range.offset as libc::off_t;
    fl.l_len = range.length as libc::off_t;
    fl
}

/// Acquire an exclusive lock on `range`, blocking until it's available.
pub fn lock_exclusive<F: AsRawFd>(file: &F, range: Range) -> Result<()> {
    let fl = make_flock(range, libc::F_WRLCK as i16);
    fcntl(file.as_raw_fd(), FcntlArg::F_SETLKW(&fl))
        .map(|_| ())
        .map_err(io_error)
}

/// Try to acquire an exclusive lock on `range` without blocking.
///
/// Returns `Ok(false)` rather than an error when the lock is held by
/// another process, so callers (chiefly recovery) can distinguish
/// contention from a hard failure.
pub fn try_lock_exclusive<F: AsRawFd>(file: &F, range: Range) -> Result<bool> {
    let fl = make_flock(range, libc::F_WRLCK as i16);
    match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl)) {
        Ok(_) => Ok(true),
        Err(Errno::EAGAIN) | Err(Errno::EACCES) => Ok(false),
        Err(e) => Err(io_error(e)),
    }
}

/// Release a previously acquired lock on `range`.
pub fn unlock<F: AsRawFd>(file: &F, range: Range) -> Result<()> {
    let fl = make_flock(range, libc::F_UNLCK as i16);
    fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl))
        .map(|_| ())
        .map_err(io_error)
}

/// RAII guard releasing a range lock on drop. Kept separate from the raw
/// functions above because the commit engine needs to hold several of
/// these across fallible steps and wants the release to happen even on an
/// early return.
pub struct RangeLockGuard<'a> {
    fd: RawFd,
    range: Range,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> RangeLockGuard<'a> {
    pub fn acquire<F: AsRawFd>(file: &'a F, range: Range) -> Result<Self> {
        lock_exclusive(file, range)?;
        Ok(Self {
            fd: file.as_raw_fd(),
            range,
            _marker: std::marker::PhantomData,
        })
    }
}

impl Drop for RangeLockGuard<'_> {
    fn drop(&mut self) {
        let fl = make_flock(self.range, libc::F_UNLCK as i16);
        if let Err(e) = fcntl(self.fd, FcntlArg::F_SETLK(&fl)) {
            log::warn!("failed to release range lock {:?}: {}", self.range, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open_rw(dir: &TempDir, name: &str) -> std::fs::File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join(name))
            .unwrap()
    }

    #[test]
    fn union_of_disjoint_ranges_spans_both() {
        let ranges = [Range::new(0, 2), Range::new(10, 2)];
        let u = Range::union(&ranges).unwrap();
        assert_eq!(u, Range::new(0, 12));
    }

    #[test]
    fn union_of_overlapping_ranges() {
        let ranges = [Range::new(0, 10), Range::new(5, 10)];
        let u = Range::union(&ranges).unwrap();
        assert_eq!(u, Range::new(0, 15));
    }

    #[test]
    fn to_eof_range_swallows_union() {
        let ranges = [Range::new(0, 5), Range::new(5, 0)];
        let u = Range::union(&ranges).unwrap();
        assert_eq!(u.length, 0);
    }

    #[test]
    fn lock_then_try_lock_from_same_fd_succeeds() {
        // fcntl locks are per-process, not per-fd: a second lock request
        // from the same process on the same file always succeeds, even on
        // an overlapping range from a different fd. This test documents
        // that (it's why the commit engine's own serialization has to be a
        // process-local mutex, not just reliance on the range lock, for
        // the intra-process case).
        let dir = TempDir::new().unwrap();
        let f1 = open_rw(&dir, "data");
        let f2 = open_rw(&dir, "data");

        lock_exclusive(&f1, Range::new(0, 10)).unwrap();
        assert!(try_lock_exclusive(&f2, Range::new(0, 10)).unwrap());
    }

    #[test]
    fn unlock_releases_range() {
        let dir = TempDir::new().unwrap();
        let f = open_rw(&dir, "data");
        lock_exclusive(&f, Range::new(0, 10)).unwrap();
        unlock(&f, Range::new(0, 10)).unwrap();
        assert!(try_lock_exclusive(&f, Range::new(0, 10)).unwrap());
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let f = open_rw(&dir, "data");
        {
            let _guard = RangeLockGuard::acquire(&f, Range::new(0, 10)).unwrap();
        }
        assert!(try_lock_exclusive(&f, Range::new(0, 10)).unwrap());
    }
}
