// src/linger.rs

//! Deferred journal retirement ("linger" mode)
//!
//! A handle opened with [`crate::handle::LibraryFlags::LINGER`] skips the
//! unlink-plus-double-fsync tail of every commit and instead appends the
//! finished transaction to [`FileHandle::linger`]. [`jsync`] walks that
//! list, fsyncs the data file exactly once no matter how many
//! transactions accumulated, then unlinks each journal file and fsyncs
//! the journal directory once. This is the throughput trade spec.md
//! describes: many small commits pay one fsync pair instead of two per
//! commit, at the cost of those journal files surviving (and being
//! re-applied, harmlessly, since the writes already landed) until the
//! next `jsync` or a crash-triggered `fsck`.

use crate::error::{Error, Result};
use crate::handle::FileHandle;

/// Flush the linger registry for `handle`. A no-op if nothing is
/// outstanding.
pub fn jsync(handle: &FileHandle) -> Result<()> {
    let mut lingering = handle.linger.lock().unwrap();
    if lingering.is_empty() {
        return Ok(());
    }

    handle.data_file().sync_all().map_err(Error::Io)?;

    {
        let jdir = handle.jdir().lock().unwrap();
        for tx in lingering.iter() {
            match std::fs::remove_file(&tx.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        jdir.fsync()?;
    }

    lingering.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::handle::{FileHandle, LibraryFlags};
    use crate::commit::Transaction;
    use tempfile::TempDir;

    #[test]
    fn jsync_is_a_noop_with_nothing_outstanding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        let handle = FileHandle::open(
            &path,
            libc::O_RDWR | libc::O_CREAT,
            0o600,
            LibraryFlags(LibraryFlags::LINGER),
            None,
        )
        .unwrap();
        handle.jsync().unwrap();
    }

    #[test]
    fn jsync_clears_multiple_lingering_transactions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        let handle = FileHandle::open(
            &path,
            libc::O_RDWR | libc::O_CREAT,
            0o600,
            LibraryFlags(LibraryFlags::LINGER),
            None,
        )
        .unwrap();

        for i in 0..3u8 {
            let mut txn = Transaction::new(&handle);
            txn.add(&[i], i as u64).unwrap();
            txn.commit().unwrap();
        }

        let jdir_path = crate::jdir::derive_path(&path);
        let count_entries = || {
            std::fs::read_dir(&jdir_path)
                .unwrap()
                .filter(|e| e.as_ref().unwrap().file_name() != "lock")
                .count()
        };
        assert_eq!(count_entries(), 3);

        handle.jsync().unwrap();
        assert_eq!(count_entries(), 0);
    }
}
