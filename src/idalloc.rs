// src/idalloc.rs

//! Transaction-ID allocation
//!
//! A single operation, [`next_id`], reserves a unique, monotonically
//! increasing 32-bit identifier per commit. IDs are unique across every
//! process sharing a journal directory because allocation happens under an
//! exclusive whole-file lock on the lock file; they advance monotonically
//! within a process because the counter only ever increases (module
//! wraparound at `u32::MAX`, which the recovery engine's in-progress-lock
//! skip makes safe to collide with old, long-finished IDs).

use fs2::FileExt;

use crate::error::{Error, Result};
use crate::jdir::JournalDir;

/// Allocate the next transaction ID from `jdir`'s shared counter.
pub fn next_id(jdir: &mut JournalDir) -> Result<u32> {
    jdir.lock_file().lock_exclusive().map_err(Error::Io)?;

    let result = (|| {
        let counter = jdir.counter_mmap_mut();
        let current = u32::from_le_bytes(counter[..4].try_into().unwrap());
        let id = match current.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        counter[..4].copy_from_slice(&id.to_le_bytes());
        counter.flush().map_err(Error::Io)?;
        Ok(id)
    })();

    FileExt::unlock(jdir.lock_file()).map_err(Error::Io)?;
    result
}
