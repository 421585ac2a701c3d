// src/fsck.rs

//! Crash recovery
//!
//! [`fsck`] scans a journal directory left behind by a prior process
//! (possibly one that crashed mid-commit) and brings the data file back
//! to a consistent state. It never looks at anything the commit protocol
//! itself didn't write: a journal file with a valid, checksummed record
//! represents a transaction whose point of no return (spec.md's step 7)
//! may or may not have run before the crash, so `fsck` always re-applies
//! it — the writes are idempotent, so reapplying ones that already landed
//! is harmless.
//!
//! IDs are processed in strict ascending order, mirroring the order
//! transactions were originally allocated and therefore the order their
//! effects were meant to be visible in.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use crate::commit::{apply_record, read_whole_file};
use crate::error::{Error, Result};
use crate::jdir::JournalDir;
use crate::lock::{self, Range};
use crate::record::TxRecord;

/// Per-category counts from one `fsck` pass. `total` is the highest
/// transaction ID observed (i.e. the number of IDs in `1..=total`
/// inspected, whether or not a file existed for each).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FsckResult {
    pub total: u32,
    pub invalid: u32,
    pub in_progress: u32,
    pub broken: u32,
    pub corrupt: u32,
    pub apply_error: u32,
    pub reapplied: u32,
}

/// Recover `data_path` using its journal directory (or `journal_dir`, if
/// given). Requires exclusive access to both files — callers must ensure
/// no other process holds the data file open for writing concurrently,
/// the same precondition the commit protocol itself relies on.
pub fn fsck(data_path: &Path, journal_dir: Option<&Path>) -> Result<FsckResult> {
    let mut jdir = JournalDir::open(data_path, journal_dir, false)?;
    let data_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(data_path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(data_path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;

    let present: std::collections::HashSet<u32> = jdir.scan_tx_ids()?.into_iter().collect();
    let max_id = present.iter().max().copied().unwrap_or(0);
    jdir.set_counter(max_id)?;
    log::info!("fsck {}: scanning transactions 1..={max_id}", data_path.display());

    let mut result = FsckResult { total: max_id, ..Default::default() };

    for id in 1..=max_id {
        if !present.contains(&id) {
            log::debug!("txn {id}: invalid (no journal file)");
            result.invalid += 1;
            continue;
        }
        process_one(&jdir, &data_file, id, &mut result);
    }

    jdir.fsync()?;
    log::info!(
        "fsck {}: done (total={}, invalid={}, in_progress={}, broken={}, corrupt={}, apply_error={}, reapplied={})",
        data_path.display(),
        result.total,
        result.invalid,
        result.in_progress,
        result.broken,
        result.corrupt,
        result.apply_error,
        result.reapplied,
    );
    Ok(result)
}

fn process_one(jdir: &JournalDir, data_file: &File, id: u32, result: &mut FsckResult) {
    let path = jdir.tx_path(id);

    let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(f) => f,
        Err(_) => {
            log::debug!("txn {id}: invalid (could not open {})", path.display());
            result.invalid += 1;
            return;
        }
    };

    let acquired = match lock::try_lock_exclusive(&file, Range::new(0, 0)) {
        Ok(acquired) => acquired,
        Err(_) => {
            log::debug!("txn {id}: in-progress (lock attempt errored)");
            result.in_progress += 1;
            return;
        }
    };
    if !acquired {
        log::debug!("txn {id}: in-progress (held by another process)");
        result.in_progress += 1;
        return;
    }

    let outcome = recover_one(&path, &mut file, data_file);
    let _ = lock::unlock(&file, Range::new(0, 0));
    drop(file);

    match outcome {
        RecoveryOutcome::Broken => {
            log::warn!("txn {id}: broken record at {}", path.display());
            result.broken += 1;
        }
        RecoveryOutcome::Corrupt => {
            log::warn!("txn {id}: checksum mismatch at {}", path.display());
            result.corrupt += 1;
        }
        RecoveryOutcome::ApplyError => {
            log::error!("txn {id}: failed to reapply record at {}", path.display());
            result.apply_error += 1;
        }
        RecoveryOutcome::Reapplied => {
            log::debug!("txn {id}: reapplied, unlinking {}", path.display());
            let _ = fs::remove_file(&path);
            result.reapplied += 1;
        }
    }
}

enum RecoveryOutcome {
    Broken,
    Corrupt,
    ApplyError,
    Reapplied,
}

fn recover_one(_path: &Path, file: &mut File, data_file: &File) -> RecoveryOutcome {
    let buf = match read_whole_file(file) {
        Ok(b) => b,
        Err(_) => return RecoveryOutcome::Broken,
    };

    let record = match TxRecord::decode(&buf) {
        Ok(r) => r,
        Err(_) => return RecoveryOutcome::Broken,
    };

    let trailer = TxRecord::trailer_checksum(&buf);
    let computed = TxRecord::compute_checksum(&buf);
    if trailer != computed {
        return RecoveryOutcome::Corrupt;
    }

    match apply_record(data_file, &record) {
        Ok(()) => RecoveryOutcome::Reapplied,
        Err(_) => RecoveryOutcome::ApplyError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Transaction;
    use crate::handle::{FileHandle, LibraryFlags};
    use crate::jdir::derive_path;
    use crate::record::{OpRecord, TxRecord as Rec};
    use std::io::Write;
    use tempfile::TempDir;

    fn read_data(path: &Path) -> Vec<u8> {
        std::fs::read(path).unwrap()
    }

    #[test]
    fn clean_directory_reports_all_zero() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        std::fs::write(&data, b"xxxx").unwrap();
        let _jdir = JournalDir::open(&data, None, true).unwrap();

        let result = fsck(&data, None).unwrap();
        assert_eq!(result, FsckResult::default());
    }

    #[test]
    fn reapplies_a_durable_uncommitted_looking_journal_file() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        std::fs::write(&data, b"OLD!").unwrap();

        let jdir = JournalDir::open(&data, None, true).unwrap();
        let record = Rec {
            id: 1,
            flags: 0,
            ops: vec![OpRecord {
                offset: 0,
                new_payload: b"NEW!".to_vec(),
                pre_image: b"OLD!".to_vec(),
            }],
        };
        let mut f = crate::jdir::create_tx_file(&jdir.tx_path(1)).unwrap();
        f.write_all(&record.encode()).unwrap();
        drop(f);

        let result = fsck(&data, None).unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.reapplied, 1);
        assert_eq!(&read_data(&data), b"NEW!");
        assert!(!jdir.tx_path(1).exists());
    }

    #[test]
    fn classifies_a_garbage_file_as_broken() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        std::fs::write(&data, b"x").unwrap();
        let jdir = JournalDir::open(&data, None, true).unwrap();
        let mut f = crate::jdir::create_tx_file(&jdir.tx_path(1)).unwrap();
        f.write_all(b"not a real record").unwrap();
        drop(f);

        let result = fsck(&data, None).unwrap();
        assert_eq!(result.broken, 1);
        assert!(jdir.tx_path(1).exists());
    }

    #[test]
    fn classifies_a_tampered_checksum_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        std::fs::write(&data, b"OLD!").unwrap();
        let jdir = JournalDir::open(&data, None, true).unwrap();
        let record = Rec {
            id: 1,
            flags: 0,
            ops: vec![OpRecord {
                offset: 0,
                new_payload: b"NEW!".to_vec(),
                pre_image: b"OLD!".to_vec(),
            }],
        };
        let mut encoded = record.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let mut f = crate::jdir::create_tx_file(&jdir.tx_path(1)).unwrap();
        f.write_all(&encoded).unwrap();
        drop(f);

        let result = fsck(&data, None).unwrap();
        assert_eq!(result.corrupt, 1);
        assert!(jdir.tx_path(1).exists());
    }

    #[test]
    fn gap_in_ids_counts_as_invalid() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        std::fs::write(&data, b"OLD!").unwrap();
        let jdir = JournalDir::open(&data, None, true).unwrap();
        // Only transaction 3 exists; 1 and 2 are gaps.
        let mut f = crate::jdir::create_tx_file(&jdir.tx_path(3)).unwrap();
        f.write_all(
            &Rec {
                id: 3,
                flags: 0,
                ops: vec![],
            }
            .encode(),
        )
        .unwrap();
        drop(f);

        let result = fsck(&data, None).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.invalid, 2);
        assert_eq!(result.reapplied, 1);
    }

    #[test]
    fn recovers_a_real_commit_through_fsck_after_journal_survives() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        let handle = FileHandle::open(
            &data,
            libc::O_RDWR | libc::O_CREAT,
            0o600,
            LibraryFlags(LibraryFlags::LINGER),
            None,
        )
        .unwrap();
        handle.data_file().set_len(4).unwrap();
        let mut txn = Transaction::new(&handle);
        txn.add(b"DONE", 0).unwrap();
        txn.commit().unwrap();
        // Linger mode left the journal file behind even though the write
        // already landed; fsck should find it, reapply (harmlessly), and
        // clean it up.
        drop(handle);

        let jdir_path = derive_path(&data);
        let remaining: Vec<_> = std::fs::read_dir(&jdir_path)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != "lock")
            .count();
        assert_eq!(remaining, 1);

        let result = fsck(&data, None).unwrap();
        assert_eq!(result.reapplied, 1);
        assert_eq!(&read_data(&data), b"DONE");
    }
}
