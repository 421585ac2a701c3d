// src/lib.rs

//! Transactional, crash-consistent writes for ordinary POSIX files.
//!
//! `jio` retrofits commit/rollback semantics onto any regular file a
//! process already knows how to read and write, without requiring a
//! database or a specialized storage format. A [`FileHandle`] wraps the
//! target file and a small on-disk journal directory kept next to it;
//! [`Transaction`]s accumulate byte-range writes and either land all at
//! once via [`Transaction::commit`] or vanish via [`Transaction::rollback`].
//! If a process dies mid-commit, [`fsck`] brings the file back to a
//! consistent state the next time anyone opens it.
//!
//! What this library does not do: multi-file transactions, isolation
//! beyond mutual exclusion on the byte ranges a transaction touches,
//! snapshot/MVCC reads, or replication. See each module's docs for the
//! specifics.

mod cleanup;
mod commit;
mod error;
mod fsck;
mod handle;
mod idalloc;
mod jdir;
mod linger;
mod lock;
mod record;

pub use cleanup::fsck_cleanup;
pub use commit::Transaction;
pub use error::{Error, Result};
pub use fsck::{fsck, FsckResult};
pub use handle::{FileHandle, LibraryFlags};

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::TempDir;

    /// End-to-end: a single committed write is durable and the journal
    /// directory is left clean.
    #[test]
    fn atomic_single_write_end_to_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.bin");
        let handle = FileHandle::open(&path, libc::O_RDWR | libc::O_CREAT, 0o600, LibraryFlags::NONE, None).unwrap();
        handle.data_file().set_len(16).unwrap();

        let mut txn = Transaction::new(&handle);
        txn.add(b"balance=100", 0).unwrap();
        txn.commit().unwrap();

        let mut buf = [0u8; 11];
        handle.data_file().read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"balance=100");
    }

    /// Two transactions committing disjoint byte ranges on the same
    /// handle both succeed and leave the data file internally consistent,
    /// even though both pass through the same lock/counter bookkeeping.
    #[test]
    fn disjoint_commits_do_not_interfere() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let handle = FileHandle::open(&path, libc::O_RDWR | libc::O_CREAT, 0o600, LibraryFlags::NONE, None).unwrap();
        handle.data_file().set_len(20).unwrap();

        let mut a = Transaction::new(&handle);
        a.add(b"AAAAA", 0).unwrap();
        a.commit().unwrap();

        let mut b = Transaction::new(&handle);
        b.add(b"BBBBB", 10).unwrap();
        b.commit().unwrap();

        let mut buf = [0u8; 20];
        handle.data_file().read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[0..5], b"AAAAA");
        assert_eq!(&buf[10..15], b"BBBBB");
    }

    /// `fsck_cleanup` tolerates being run twice in a row.
    #[test]
    fn fsck_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let handle = FileHandle::open(&path, libc::O_RDWR | libc::O_CREAT, 0o600, LibraryFlags::NONE, None).unwrap();
        drop(handle);

        fsck_cleanup(&path, None).unwrap();
        fsck_cleanup(&path, None).unwrap();
    }

    /// `move_journal` relocates the journal directory in place; a
    /// transaction opened against the handle afterward commits against
    /// the new location.
    #[test]
    fn move_journal_relocates_to_a_new_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let handle = FileHandle::open(&path, libc::O_RDWR | libc::O_CREAT, 0o600, LibraryFlags::NONE, None).unwrap();

        let new_path = dir.path().join("custom.journal");
        handle.move_journal(&new_path).unwrap();
        assert!(new_path.is_dir());

        let mut txn = Transaction::new(&handle);
        txn.add(b"x", 0).unwrap();
        txn.commit().unwrap();
    }

    /// `fsck` on a data file with no journal directory at all (never
    /// opened through this library, so no `.{name}.jio` sibling exists)
    /// reports `ENOJOURNAL` rather than a clean zero result.
    #[test]
    fn fsck_without_a_journal_directory_reports_journal_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"no journal here").unwrap();

        let err = fsck(&path, None).unwrap_err();
        assert!(matches!(err, Error::JournalAbsent(_)));
    }
}
