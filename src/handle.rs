// src/handle.rs

//! The open data-file handle
//!
//! [`FileHandle`] is the thing every other public operation hangs off of:
//! it owns the data file descriptor, the journal directory, the library
//! flags chosen at open time, and the bookkeeping two operations need
//! beyond their own arguments — `move_journal`'s in-flight check and
//! linger's outstanding-transaction list. One `FileHandle` is built per
//! call to [`FileHandle::open`] and is not `Clone`; share it across
//! threads behind the application's own synchronization if needed; the
//! internals already serialize the pieces that must be (transaction
//! setup/teardown, ID allocation, the linger registry).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::jdir::JournalDir;

/// Library-level feature flags, set at [`crate::open`] time and inherited
/// by every transaction opened against the handle unless noted otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryFlags(pub u32);

impl LibraryFlags {
    /// Skip all locking. Caller is asserting it owns exclusive access to
    /// the data file by some other means.
    pub const NOLOCK: u32 = 1 << 0;
    /// Disable `trans_rollback` on transactions opened against this
    /// handle.
    pub const NOROLLBACK: u32 = 1 << 1;
    /// Defer journal-file unlinks until an explicit `jsync` call.
    pub const LINGER: u32 = 1 << 2;
    /// Reject every `trans_*` call; the handle may still be used for
    /// `fsck`.
    pub const RDONLY: u32 = 1 << 3;

    pub const NONE: LibraryFlags = LibraryFlags(0);

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

impl Default for LibraryFlags {
    fn default() -> Self {
        LibraryFlags::NONE
    }
}

impl std::ops::BitOr for LibraryFlags {
    type Output = LibraryFlags;
    fn bitor(self, rhs: LibraryFlags) -> LibraryFlags {
        LibraryFlags(self.0 | rhs.0)
    }
}

/// An outstanding, committed-but-not-yet-unlinked transaction file kept
/// around because the handle was opened with [`LibraryFlags::LINGER`].
#[derive(Debug)]
pub(crate) struct LingeringTx {
    pub id: u32,
    pub path: PathBuf,
}

pub struct FileHandle {
    data_file: File,
    data_path: PathBuf,
    jdir: Mutex<JournalDir>,
    flags: LibraryFlags,
    /// Serializes transaction setup/teardown (ID allocation, lock
    /// acquisition bookkeeping) and `move_journal`'s in-flight probe
    /// against each other within this process. Crossing processes relies
    /// on the lock file itself, not this.
    pub(crate) txn_guard: Mutex<()>,
    pub(crate) linger: Mutex<Vec<LingeringTx>>,
}

fn translate_open_flags(opts: &mut OpenOptions, posix_flags: i32, mode: u32) {
    let accmode = posix_flags & libc::O_ACCMODE;
    opts.read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR);
    opts.write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR);
    if posix_flags & libc::O_CREAT != 0 {
        opts.create(true);
    }
    if posix_flags & libc::O_EXCL != 0 {
        opts.create_new(true);
    }
    if posix_flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if posix_flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    opts.mode(mode);
    // Pass through anything else (O_SYNC, O_DIRECT, ...) verbatim.
    opts.custom_flags(posix_flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND));
}

impl FileHandle {
    /// Open `path` as a data file with POSIX `open(2)`-style `posix_flags`
    /// and `mode`, bootstrapping (or validating) its journal directory.
    /// `journal_dir` overrides the default `dir(data)/.{basename}.jio`
    /// location.
    pub fn open(
        path: &Path,
        posix_flags: i32,
        mode: u32,
        flags: LibraryFlags,
        journal_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut opts = OpenOptions::new();
        translate_open_flags(&mut opts, posix_flags, mode);
        let data_file = opts.open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;

        let jdir = JournalDir::open(path, journal_dir, true)?;

        Ok(Self {
            data_file,
            data_path: path.to_path_buf(),
            jdir: Mutex::new(jdir),
            flags,
            txn_guard: Mutex::new(()),
            linger: Mutex::new(Vec::new()),
        })
    }

    pub fn flags(&self) -> LibraryFlags {
        self.flags
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub(crate) fn data_file(&self) -> &File {
        &self.data_file
    }

    pub(crate) fn jdir(&self) -> &Mutex<JournalDir> {
        &self.jdir
    }

    /// Flush any lingering transactions and drop the handle. A plain
    /// `drop` does the same thing minus the jsync; callers that opened
    /// with [`LibraryFlags::LINGER`] should call this explicitly to make
    /// sure outstanding journal files get cleaned up.
    pub fn close(self) -> Result<()> {
        crate::linger::jsync(&self)?;
        Ok(())
    }

    /// Flush the linger registry: fsync the data file once, then unlink
    /// every tracked journal file and fsync the journal directory.
    /// A no-op if nothing is lingering.
    pub fn jsync(&self) -> Result<()> {
        crate::linger::jsync(self)
    }

    /// Relocate the journal directory to `new_path`. Refuses if a
    /// transaction is currently mid-commit (best-effort, non-blocking
    /// probe) or if `new_path` already exists.
    pub fn move_journal(&self, new_path: &Path) -> Result<()> {
        let _guard = self.txn_guard.lock().unwrap();
        let mut jdir = self.jdir.lock().unwrap();

        // Non-blocking probe: if another thread/process is mid-allocation
        // (holding the lock file's whole-file lock), refuse rather than
        // rename out from under it.
        let busy = !fs2::FileExt::try_lock_exclusive(jdir.lock_file()).map(|_| true).unwrap_or(false);
        if busy {
            return Err(Error::Contention(
                "journal directory has an in-progress transaction".into(),
            ));
        }
        fs2::FileExt::unlock(jdir.lock_file()).map_err(Error::Io)?;

        jdir.rename_to(new_path)
    }
}
