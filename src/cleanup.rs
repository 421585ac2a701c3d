// src/cleanup.rs

//! Unconditional journal-directory removal
//!
//! `jfsck_cleanup` is the blunt counterpart to [`crate::fsck::fsck`]: where
//! `fsck` inspects and replays each transaction file before deciding its
//! fate, cleanup just deletes every `lock`/positive-integer-named entry
//! in the journal directory and removes the directory itself, with no
//! attempt to apply or validate anything first. It exists for the case
//! spec.md calls "never commit again with this journal directory" — e.g.
//! after `fsck` has already run and the caller just wants the directory
//! gone, or the data file itself is being deleted.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::jdir::{derive_path, parse_tx_filename};

/// Remove `data_path`'s journal directory (or `journal_dir` if given)
/// and every entry in it. Idempotent: a missing directory is not an
/// error.
pub fn fsck_cleanup(data_path: &Path, journal_dir: Option<&Path>) -> Result<()> {
    let path = journal_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| derive_path(data_path));
    remove_journal_dir(&path)
}

fn remove_journal_dir(path: &Path) -> Result<()> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("cleanup {}: already absent", path.display());
            return Ok(());
        }
        Err(e) => return Err(Error::Io(e)),
    };
    let mut removed = 0u32;
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        if let Some(name) = entry.file_name().to_str() {
            if name == "lock" || parse_tx_filename(name).is_some() {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }
    }
    log::info!("cleanup {}: removed {removed} journal entries", path.display());
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self as stdfs, File};
    use tempfile::TempDir;

    #[test]
    fn removes_lock_and_tx_files_and_the_directory() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        let jdir_path = derive_path(&data);
        stdfs::create_dir(&jdir_path).unwrap();
        File::create(jdir_path.join("lock")).unwrap();
        File::create(jdir_path.join("3")).unwrap();

        fsck_cleanup(&data, None).unwrap();
        assert!(!jdir_path.exists());
    }

    #[test]
    fn is_idempotent_on_an_absent_directory() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        fsck_cleanup(&data, None).unwrap();
        fsck_cleanup(&data, None).unwrap();
    }

    #[test]
    fn honors_an_explicit_override_path() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data.db");
        let custom = dir.path().join("elsewhere.jio");
        stdfs::create_dir(&custom).unwrap();
        File::create(custom.join("1")).unwrap();

        fsck_cleanup(&data, Some(&custom)).unwrap();
        assert!(!custom.exists());
    }
}
