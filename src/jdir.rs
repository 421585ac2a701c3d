// src/jdir.rs

//! Journal directory management
//!
//! Derives the hidden sibling directory for a data file, creates and
//! validates it, and owns the directory handle used to fsync renames and
//! unlinks within it. Also owns the lock file that carries the shared
//! monotonic transaction-ID counter (see [`crate::idalloc`]).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

const COUNTER_BYTES: usize = 4;

/// Compute the default journal directory path for a data file:
/// `dir(data)/.{basename(data)}.jio`.
pub fn derive_path(data_path: &Path) -> PathBuf {
    let parent = data_path.parent().unwrap_or_else(|| Path::new("."));
    let name = data_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent.join(format!(".{name}.jio"))
}

/// A transaction filename must be either the literal `lock` or parse as a
/// positive decimal integer; anything else is ignored by commit and
/// recovery alike.
pub fn parse_tx_filename(name: &str) -> Option<u32> {
    if name.is_empty() || name == "lock" {
        return None;
    }
    if !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if name.starts_with('0') && name.len() > 1 {
        return None;
    }
    name.parse::<u32>().ok().filter(|id| *id > 0)
}

/// Open handle on the journal directory plus its lock file and counter
/// mmap.
pub struct JournalDir {
    path: PathBuf,
    dir_file: File,
    lock_file: File,
    counter: MmapMut,
}

impl JournalDir {
    /// Open (creating if `create` is set and absent) the journal directory
    /// derived from or overriding `data_path`, and its lock file.
    pub fn open(data_path: &Path, override_path: Option<&Path>, create: bool) -> Result<Self> {
        let path = override_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| derive_path(data_path));

        if create {
            match fs::create_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::Io(e)),
            }
        } else if !path.exists() {
            return Err(Error::JournalAbsent(path));
        }

        let metadata = fs::metadata(&path).map_err(|_| Error::JournalAbsent(path.clone()))?;
        if !metadata.is_dir() {
            return Err(Error::Malformed(format!(
                "journal path {} exists and is not a directory",
                path.display()
            )));
        }

        let dir_file = File::open(&path).map_err(Error::Io)?;

        let lock_path = path.join("lock");
        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true);
        if create {
            open_opts.create(true);
        }
        let lock_file = open_opts
            .open(&lock_path)
            .map_err(|_| Error::JournalAbsent(lock_path.clone()))?;

        let is_new = lock_file.metadata().map(|m| m.len() == 0).unwrap_or(false);
        if is_new {
            if !create {
                return Err(Error::JournalAbsent(lock_path));
            }
            // Hold the whole-file lock while initializing, so two
            // concurrent first-openers don't race to write the counter.
            lock_file.lock_exclusive().map_err(Error::Io)?;
            // Re-check under the lock: another process may have won the
            // race to extend and initialize the file already.
            let len = lock_file.metadata().map_err(Error::Io)?.len();
            if len == 0 {
                lock_file.set_len(COUNTER_BYTES as u64).map_err(Error::Io)?;
                let mut mmap = unsafe { MmapOptions::new().len(COUNTER_BYTES).map_mut(&lock_file)? };
                // The counter holds the highest transaction ID *issued so
                // far*, not the next one to hand out: `next_id` computes
                // `id = counter + 1`, so a fresh journal directory (no
                // transaction has ever run) starts at 0, giving the first
                // caller ID 1 — matching spec's own worked example, where
                // the very first commit's journal file is named `1`, and
                // the data model's "0 = unassigned" convention for
                // transaction IDs.
                mmap[..4].copy_from_slice(&0u32.to_le_bytes());
                mmap.flush().map_err(Error::Io)?;
            }
            FileExt::unlock(&lock_file).map_err(Error::Io)?;
        } else if lock_file.metadata().map(|m| m.len()).unwrap_or(0) < COUNTER_BYTES as u64 {
            lock_file.set_len(COUNTER_BYTES as u64).map_err(Error::Io)?;
        }

        let counter = unsafe { MmapOptions::new().len(COUNTER_BYTES).map_mut(&lock_file)? };

        Ok(Self {
            path,
            dir_file,
            lock_file,
            counter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_file(&self) -> &File {
        &self.lock_file
    }

    pub fn counter_mmap_mut(&mut self) -> &mut MmapMut {
        &mut self.counter
    }

    /// Path of the journal file for transaction `id`.
    pub fn tx_path(&self, id: u32) -> PathBuf {
        self.path.join(id.to_string())
    }

    /// fsync the directory itself, making prior renames/unlinks/creates of
    /// entries in it durable. Critical after writing a transaction file
    /// and after unlinking one.
    pub fn fsync(&self) -> Result<()> {
        self.dir_file.sync_all().map_err(Error::Io)
    }

    /// Overwrite the counter with `value` directly (used by fsck after
    /// scanning for the highest surviving transaction ID).
    pub fn set_counter(&mut self, value: u32) -> Result<()> {
        self.lock_file.lock_exclusive().map_err(Error::Io)?;
        self.counter[..4].copy_from_slice(&value.to_le_bytes());
        self.counter.flush().map_err(Error::Io)?;
        FileExt::unlock(&self.lock_file).map_err(Error::Io)?;
        Ok(())
    }

    /// Iterate the positive-integer-named entries currently in the
    /// journal directory (excludes `lock` and anything else that doesn't
    /// parse).
    pub fn scan_tx_ids(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = parse_tx_filename(name) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Relocate the journal directory to `new_path` in place. Errors if
    /// `new_path` already exists. Callers are responsible for ensuring no
    /// transaction is mid-commit (the `FileHandle`-level mutex and an
    /// in-progress probe on the lock file provide that guarantee — see
    /// `FileHandle::move_journal`).
    pub fn rename_to(&mut self, new_path: &Path) -> Result<()> {
        if new_path.exists() {
            return Err(Error::AlreadyExists(new_path.to_path_buf()));
        }
        let old_path = self.path.clone();
        fs::rename(&old_path, new_path).map_err(Error::Io)?;
        if let Some(parent) = new_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        let reopened = Self::open(new_path, Some(new_path), false)?;
        *self = reopened;
        Ok(())
    }
}

/// Low-level file creation helper for transaction files: `O_RDWR|O_CREAT
/// |O_TRUNC`, mode 0600, matching spec.md's exact commit-step-2 flags.
pub fn create_tx_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(Error::Io)
}
